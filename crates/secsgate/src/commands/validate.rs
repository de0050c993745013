//! `secsgate validate`: load, check, and summarise the configuration.

use serde::Serialize;
use tabled::Tabled;

use secsgate_core::DeviceConfig;

use crate::cli::{GlobalOpts, OutputFormat, ValidateArgs};
use crate::error::CliError;
use crate::output;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Debug, Tabled, Serialize)]
struct DeviceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Endpoint")]
    endpoint: String,
    #[tabled(rename = "Mode")]
    mode: String,
    #[tabled(rename = "Data collection")]
    data_collection: String,
    #[tabled(rename = "Alarms")]
    alarms: String,
    #[tabled(rename = "Remote")]
    remote_control: String,
}

impl From<&DeviceConfig> for DeviceRow {
    fn from(d: &DeviceConfig) -> Self {
        let s = &d.settings;
        let data_collection = if s.data_collection.enabled {
            format!(
                "{} vars / {} events every {}s",
                s.data_collection.variable_ids.len(),
                s.data_collection.event_ids.len(),
                s.data_collection.interval.as_secs()
            )
        } else {
            "off".into()
        };
        let alarms = if s.alarms.enabled {
            format!("{} enabled", s.alarms.alarm_ids.len())
        } else {
            "off".into()
        };
        Self {
            id: d.equipment_id.to_string(),
            name: d.name.clone(),
            endpoint: d.endpoint.to_string(),
            mode: format!("{:?}", s.hsms.mode).to_lowercase(),
            data_collection,
            alarms,
            remote_control: if s.remote_control.enabled { "on" } else { "off" }.into(),
        }
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: &ValidateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = super::load_validated(global)?;

    if args.effective {
        let toml = config
            .to_toml()
            .map_err(|e| CliError::config(&global.config_path(), e))?;
        output::print_output(&toml, global.quiet);
        return Ok(());
    }

    let devices = config
        .device_configs()
        .map_err(|e| CliError::config(&global.config_path(), e))?;
    let rows: Vec<DeviceRow> = devices.iter().map(DeviceRow::from).collect();
    if !rows.is_empty() {
        let out = output::render_list(global.output, &rows, |r| r.id.clone())?;
        output::print_output(&out, global.quiet);
    }
    if global.output == OutputFormat::Table {
        output::print_output(
            &format!(
                "Configuration OK: {} device(s), up to {} concurrent connection attempts",
                rows.len(),
                config.fleet.max_concurrent_connections
            ),
            global.quiet,
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use secsgate_config::{AlarmSection, DeviceEntry, GatewayConfig};

    #[test]
    fn rows_summarise_device_features() {
        let mut config = GatewayConfig::default();
        let mut entry = DeviceEntry::new("ETCH-01", "10.0.0.1:5000");
        entry.alarms = Some(AlarmSection {
            enabled: true,
            alarm_ids: vec![1, 2],
            sync_interval_secs: 60,
        });
        config.devices.push(entry);

        let devices = config.device_configs().unwrap();
        let row = DeviceRow::from(&devices[0]);
        assert_eq!(row.id, "ETCH-01");
        assert_eq!(row.endpoint, "10.0.0.1:5000");
        assert_eq!(row.mode, "active");
        assert_eq!(row.data_collection, "off");
        assert_eq!(row.alarms, "2 enabled");
        assert_eq!(row.remote_control, "on");
    }
}
