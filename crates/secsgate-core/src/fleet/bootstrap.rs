// ── Bootstrap handshake ──
//
// A throwaway session that identifies a tool before the fleet commits any
// state to it: connect + select, S1F13 for MDLN/SOFTREV, S1F3 over the
// identity SVIDs, then close.

use std::sync::Arc;
use std::time::Duration;

use secsgate_hsms::{Endpoint, HsmsClient, HsmsConfig, SecsItem, SessionFactory};
use tracing::debug;

use crate::config::IdentitySvids;
use crate::error::CoreError;
use crate::model::{Capability, MachineMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceIdentity {
    pub model: String,
    pub software_revision: String,
    pub reported_id: Option<String>,
    pub manufacturer: Option<String>,
    pub serial: Option<String>,
}

impl DeviceIdentity {
    pub(crate) fn metadata(&self) -> MachineMetadata {
        MachineMetadata {
            vendor: self.manufacturer.clone().unwrap_or_default(),
            model: self.model.clone(),
            serial: self.serial.clone().unwrap_or_default(),
            software_revision: self.software_revision.clone(),
            capabilities: Capability::gem_baseline(),
        }
    }
}

fn text(item: Option<&SecsItem>) -> Option<String> {
    item.and_then(SecsItem::as_ascii)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

pub(crate) async fn identify(
    endpoint: Endpoint,
    hsms: &HsmsConfig,
    svids: IdentitySvids,
    factory: Arc<dyn SessionFactory>,
    timeout: Duration,
) -> Result<DeviceIdentity, CoreError> {
    let config = HsmsConfig {
        heartbeat_interval: Duration::ZERO,
        auto_reconnect: false,
        ..hsms.clone()
    };
    let client = HsmsClient::new(endpoint, config, factory);
    let result = handshake(&client, svids, timeout).await;
    client.shutdown().await;
    result
}

async fn handshake(
    client: &HsmsClient,
    svids: IdentitySvids,
    timeout: Duration,
) -> Result<DeviceIdentity, CoreError> {
    client.connect(timeout).await?;
    let online = client
        .identity()
        .ok_or_else(|| CoreError::Protocol {
            message: "no S1F14 identity after establish communication".into(),
        })?;

    let values = client
        .get_equipment_state(&[svids.equipment_id, svids.manufacturer, svids.serial])
        .await?;
    let identity = DeviceIdentity {
        model: online.model.trim().to_owned(),
        software_revision: online.software_revision.trim().to_owned(),
        reported_id: text(values.first()),
        manufacturer: text(values.get(1)),
        serial: text(values.get(2)),
    };
    debug!(endpoint = %client.endpoint(), model = %identity.model, id = ?identity.reported_id, "device identified");
    Ok(identity)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secsgate_hsms::sim::{SimulatedEquipment, SimulatedFactory};

    #[tokio::test]
    async fn reads_identity_and_closes_the_session() {
        let factory = Arc::new(SimulatedFactory::new());
        let endpoint: Endpoint = "10.3.0.1:5000".parse().unwrap();
        factory.add(
            endpoint,
            SimulatedEquipment::new("CVD-200 ", "7.1")
                .with_variable(1001, SecsItem::ascii("CVD-07"))
                .with_variable(1002, SecsItem::ascii("Acme"))
                .with_variable(1003, SecsItem::ascii("SN-42")),
        );

        let identity = identify(
            endpoint,
            &HsmsConfig::default(),
            IdentitySvids::default(),
            factory.clone(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(identity.model, "CVD-200");
        assert_eq!(identity.reported_id.as_deref(), Some("CVD-07"));
        assert_eq!(identity.metadata().vendor, "Acme");
        assert_eq!(identity.metadata().serial, "SN-42");
        assert_eq!(factory.open_sessions(), 0);
    }

    #[tokio::test]
    async fn unset_identity_variables_are_none() {
        let factory = Arc::new(SimulatedFactory::new());
        let endpoint: Endpoint = "10.3.0.2:5000".parse().unwrap();
        factory.add(endpoint, SimulatedEquipment::new("ETCH-3000", "1.0"));

        let identity = identify(
            endpoint,
            &HsmsConfig::default(),
            IdentitySvids::default(),
            factory,
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert_eq!(identity.reported_id, None);
        assert!(identity.metadata().validate().is_err());
    }
}
