use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{CreationState, PgReplicaIdentity};

/// Log output format of the master binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Runtime knobs of the xrepl master. Every field has a default so partial
/// config files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Addresses this master answers on; setup requests pointing here are rejected.
    pub master_addresses: Vec<String>,
    /// WAL retention applied to tables covered by a stream.
    pub cdc_wal_retention_secs: u64,
    /// Cap on streams carrying a replication slot name.
    pub max_replication_slots: usize,
    /// Tables handled per dynamic reconciliation pass.
    pub cdcsdk_table_processing_limit_per_run: usize,
    /// Whether newly created tables join existing namespace streams.
    pub cdcsdk_enable_dynamic_table_addition: bool,
    /// Allow index tables in CDCSDK streams. Test only.
    pub cdcsdk_enable_indexes_in_stream: bool,
    /// Allow consistent snapshot stream creation.
    pub yb_enable_cdc_consistent_snapshot_streams: bool,
    /// Replicate the transaction status table for transactional groups.
    pub enable_replicate_transaction_status_table: bool,
    /// Skip producer/consumer schema comparison during setup.
    pub xcluster_skip_schema_compatibility_checks: bool,
    /// Replica identity for tables without an explicit one.
    pub default_replica_identity: PgReplicaIdentity,
    /// Poll period while waiting for tablets to report a safe op id.
    pub safe_op_id_poll_interval_ms: u64,
    /// Poll period while waiting for a snapshot restoration.
    pub restore_poll_interval_ms: u64,
    /// Deadline applied to RPCs that do not carry one.
    pub default_rpc_timeout_ms: u64,
    /// Period of the background reconciliation loop.
    pub bg_task_interval_ms: u64,
    /// Output format of the binary's logs.
    pub log_format: LogFormat,
    /// Abort namespace stream creation right after reaching this state. Test only.
    pub test_abort_stream_creation_at: Option<CreationState>,
    /// Fail universe setup when this many tables have been validated. Test only.
    pub test_fail_setup_replication_after_validated: Option<usize>,
    /// Fail the bootstrap pipeline when entering the named stage. Test only.
    pub test_fail_bootstrap_at: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            master_addresses: Vec::new(),
            cdc_wal_retention_secs: 28_800,
            max_replication_slots: 10,
            cdcsdk_table_processing_limit_per_run: 2,
            cdcsdk_enable_dynamic_table_addition: true,
            cdcsdk_enable_indexes_in_stream: false,
            yb_enable_cdc_consistent_snapshot_streams: true,
            enable_replicate_transaction_status_table: false,
            xcluster_skip_schema_compatibility_checks: false,
            default_replica_identity: PgReplicaIdentity::Change,
            safe_op_id_poll_interval_ms: 50,
            restore_poll_interval_ms: 100,
            default_rpc_timeout_ms: 30_000,
            bg_task_interval_ms: 1_000,
            log_format: LogFormat::Text,
            test_abort_stream_creation_at: None,
            test_fail_setup_replication_after_validated: None,
            test_fail_bootstrap_at: None,
        }
    }
}

impl MasterConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MasterConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the managers cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cdcsdk_table_processing_limit_per_run == 0 {
            anyhow::bail!("cdcsdk_table_processing_limit_per_run must be positive");
        }
        if self.bg_task_interval_ms == 0 {
            anyhow::bail!("bg_task_interval_ms must be positive");
        }
        if self.safe_op_id_poll_interval_ms == 0 || self.restore_poll_interval_ms == 0 {
            anyhow::bail!("poll intervals must be positive");
        }
        Ok(())
    }

    /// Default RPC deadline as a duration.
    pub fn default_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.default_rpc_timeout_ms)
    }

    /// Background loop period as a duration.
    pub fn bg_task_interval(&self) -> Duration {
        Duration::from_millis(self.bg_task_interval_ms)
    }

    /// Safe op id poll period as a duration.
    pub fn safe_op_id_poll_interval(&self) -> Duration {
        Duration::from_millis(self.safe_op_id_poll_interval_ms)
    }

    /// Restore poll period as a duration.
    pub fn restore_poll_interval(&self) -> Duration {
        Duration::from_millis(self.restore_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = MasterConfig::default();
        assert_eq!(config.cdc_wal_retention_secs, 28_800);
        assert_eq!(config.max_replication_slots, 10);
        assert_eq!(config.cdcsdk_table_processing_limit_per_run, 2);
        assert!(config.cdcsdk_enable_dynamic_table_addition);
        assert!(!config.cdcsdk_enable_indexes_in_stream);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.test_abort_stream_creation_at.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file_partial() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "max_replication_slots = 3").unwrap();
        writeln!(file, "log_format = \"json\"").unwrap();
        let config = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_replication_slots, 3);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.bg_task_interval_ms, 1_000);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{"cdcsdk_table_processing_limit_per_run": 5, "master_addresses": ["m1:7100"]}}"#
        )
        .unwrap();
        let config = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cdcsdk_table_processing_limit_per_run, 5);
        assert_eq!(config.master_addresses, vec!["m1:7100".to_string()]);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(MasterConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limit() {
        let config = MasterConfig {
            cdcsdk_table_processing_limit_per_run: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
