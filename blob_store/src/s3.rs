use std::env;

use anyhow::{anyhow, Result};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    path::Path,
    ObjectStore,
};
use url::Url;

/// Builds an S3 store for `url`, preferring `AWS_*` keys from the
/// environment over instance metadata credentials.
pub(crate) fn build_s3_store(url: &Url) -> Result<(Box<dyn ObjectStore>, Path)> {
    let opts: Vec<(AmazonS3ConfigKey, String)> = env::vars_os()
        .filter_map(|(os_key, os_value)| {
            let (key, value) = (os_key.to_str()?, os_value.to_str()?);
            if !key.starts_with("AWS_") {
                return None;
            }
            let config_key = key.to_ascii_lowercase().parse().ok()?;
            Some((config_key, value.to_string()))
        })
        .collect();

    let mut builder = AmazonS3Builder::new().with_url(url.as_str());
    for (key, value) in opts {
        builder = builder.with_config(key, value);
    }
    // localstack and minio in tests
    if let Ok(endpoint) = env::var("AWS_ENDPOINT_URL") {
        if endpoint.starts_with("http://") {
            builder = builder.with_allow_http(true);
        }
        builder = builder.with_endpoint(endpoint);
    }
    let store = builder
        .build()
        .map_err(|e| anyhow!("failed to create s3 store for {}: {}", url, e))?;
    let path = Path::from_url_path(url.path())?;
    Ok((Box::new(store), path))
}
