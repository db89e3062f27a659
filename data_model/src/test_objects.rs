pub mod tests {
    use crate::{
        Agent,
        AgentId,
        AssetGroupId,
        CommandPayload,
        PrivacyCommand,
        PrivacyCommandBuilder,
        Subject,
        TimeRangePredicate,
        VariantId,
    };

    pub const TEST_AGENT_ID: &str = "test_agent_1";
    pub const TEST_AGENT_ID_2: &str = "test_agent_2";
    pub const TEST_ASSET_GROUP_ID: &str = "test_asset_group_1";
    pub const TEST_ASSET_GROUP_ID_2: &str = "test_asset_group_2";
    pub const TEST_REQUESTER: &str = "test_requester";
    pub const TEST_EXPORT_URI: &str = "memory:///exports";

    pub fn mock_msa_subject() -> Subject {
        Subject::Msa { puid: 985_154_046 }
    }

    pub fn mock_agent(agent_id: &str) -> Agent {
        Agent {
            id: AgentId::from(agent_id),
            ..Default::default()
        }
    }

    pub fn mock_agent_honoring(agent_id: &str, asset_group_id: &str, variant: &str) -> Agent {
        let mut agent = mock_agent(agent_id);
        agent
            .honored_variants
            .entry(AssetGroupId::from(asset_group_id))
            .or_default()
            .insert(VariantId::from(variant));
        agent
    }

    pub fn mock_command(payload: CommandPayload) -> PrivacyCommand {
        PrivacyCommandBuilder::default()
            .subject(mock_msa_subject())
            .requester(TEST_REQUESTER.to_string())
            .context("test context".to_string())
            .payload(payload)
            .build()
            .unwrap()
    }

    pub fn mock_export_command() -> PrivacyCommand {
        mock_command(CommandPayload::Export {
            data_types: vec!["BrowsingHistory".to_string(), "SearchHistory".to_string()],
            storage_uri: TEST_EXPORT_URI.to_string(),
        })
    }

    pub fn mock_delete_command() -> PrivacyCommand {
        mock_command(CommandPayload::Delete {
            time_range: TimeRangePredicate {
                start_time: 0,
                end_time: u64::MAX,
            },
            data_type: Some("BrowsingHistory".to_string()),
            data_type_predicate: None,
        })
    }

    pub fn mock_age_out_command() -> PrivacyCommand {
        mock_command(CommandPayload::AgeOut {
            is_suspended: false,
            last_active_time: Some(0),
        })
    }

    pub fn mock_synthetic_command() -> PrivacyCommand {
        let mut command = mock_delete_command();
        command.is_synthetic = true;
        command
    }
}
