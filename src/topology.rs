//! Static fleet topology.
//!
//! Describes who takes part in a run: one aggregator, an ordered list of
//! parties (order is the training client index), and the power collectors
//! that sample a tester on behalf of one party each. The topology is built
//! once from configuration and handed to the orchestrator; it is never
//! mutated during a campaign. The only per-device state that changes between
//! runs, whether a collector is paired to its tester, lives in [`PairingCache`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, FleetError};
use crate::remote::Device;

/// The device hosting the training coordinator and the control bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregator {
    /// Login identity on the device
    pub identity: String,
    /// Network address
    pub address: String,
    /// Port the training coordinator listens on
    pub training_port: u16,
    /// Port the control bus publisher binds
    pub broadcast_port: u16,
}

impl Aggregator {
    /// Remote login for the aggregator.
    pub fn device(&self) -> Device {
        Device::new(&self.identity, &self.address)
    }

    /// `address:broadcast_port`, as handed to bus subscribers.
    pub fn bus_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.broadcast_port)
    }
}

/// A worker device taking part in training.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// Login identity on the device
    pub identity: String,
    /// Network address
    pub address: String,
    /// Port on which the party's worker publishes its own signals, if any
    #[serde(default)]
    pub signal_port: Option<u16>,
}

impl Party {
    /// Remote login for the party.
    pub fn device(&self) -> Device {
        Device::new(&self.identity, &self.address)
    }
}

/// A device sampling a power tester over a wireless serial link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerCollector {
    /// Login identity on the device
    pub identity: String,
    /// Network address
    pub address: String,
    /// Identity of the party whose power draw this collector measures
    pub party: String,
    /// Hardware address of the tester
    pub tester_address: String,
    /// Bus port to subscribe to; defaults to the aggregator's broadcast port
    #[serde(default)]
    pub broadcast_port: Option<u16>,
    /// Serial device the tester link is bound to on the collector
    #[serde(default = "default_serial_device")]
    pub serial_device: String,
}

fn default_serial_device() -> String {
    "/dev/rfcomm0".to_string()
}

impl PowerCollector {
    /// Remote login for the collector.
    pub fn device(&self) -> Device {
        Device::new(&self.identity, &self.address)
    }

    /// Base name (without extension) of the measurement file for one run.
    pub fn measurement_name(&self, run_folder: &str) -> String {
        format!("{}_{}", run_folder, self.party)
    }
}

/// Immutable description of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetTopology {
    aggregator: Aggregator,
    parties: Vec<Party>,
    collectors: Vec<PowerCollector>,
}

impl FleetTopology {
    /// Build a topology, checking that identities are unique and that every
    /// collector measures a known party. Collectors without an explicit
    /// broadcast port inherit the aggregator's.
    pub fn new(
        aggregator: Aggregator,
        parties: Vec<Party>,
        collectors: Vec<PowerCollector>,
    ) -> AppResult<Self> {
        if parties.is_empty() {
            return Err(FleetError::Configuration(
                "fleet must contain at least one party".to_string(),
            ));
        }

        let mut seen: HashMap<&str, &str> = HashMap::new();
        seen.insert(&aggregator.identity, "aggregator");
        for party in &parties {
            if seen.insert(&party.identity, "party").is_some() {
                return Err(FleetError::Configuration(format!(
                    "duplicate device identity '{}'",
                    party.identity
                )));
            }
        }
        for collector in &collectors {
            if !parties.iter().any(|p| p.identity == collector.party) {
                return Err(FleetError::Configuration(format!(
                    "collector '{}' measures unknown party '{}'",
                    collector.identity, collector.party
                )));
            }
            if seen.insert(&collector.identity, "collector").is_some() {
                return Err(FleetError::Configuration(format!(
                    "duplicate device identity '{}'",
                    collector.identity
                )));
            }
        }

        let collectors = collectors
            .into_iter()
            .map(|mut c| {
                c.broadcast_port.get_or_insert(aggregator.broadcast_port);
                c
            })
            .collect();

        Ok(Self {
            aggregator,
            parties,
            collectors,
        })
    }

    /// Fail with `ConfigMismatch` when the roster disagrees with `declared`.
    pub fn expect_parties(&self, declared: usize) -> AppResult<()> {
        if declared != self.parties.len() {
            return Err(FleetError::ConfigMismatch {
                declared,
                actual: self.parties.len(),
            });
        }
        Ok(())
    }

    /// Host running training and the control bus.
    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Parties in training-client index order.
    pub fn parties(&self) -> &[Party] {
        &self.parties
    }

    /// Power collectors in configuration order.
    pub fn collectors(&self) -> &[PowerCollector] {
        &self.collectors
    }

    /// Every device touched by a run: aggregator first, then parties.
    pub fn compute_devices(&self) -> Vec<Device> {
        std::iter::once(self.aggregator.device())
            .chain(self.parties.iter().map(Party::device))
            .collect()
    }
}

/// Soft cache of which collectors are paired to their tester.
///
/// Pairing is slow and blocking, so it is skipped for collectors already
/// paired; remediation invalidates the entry so the next run re-pairs.
#[derive(Debug, Clone, Default)]
pub struct PairingCache {
    paired: HashMap<String, bool>,
}

impl PairingCache {
    /// Cache with no collector paired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `collector` is known to be paired.
    pub fn is_paired(&self, collector: &str) -> bool {
        self.paired.get(collector).copied().unwrap_or(false)
    }

    /// Record a successful pairing.
    pub fn mark_paired(&mut self, collector: &str) {
        self.paired.insert(collector.to_string(), true);
    }

    /// Force the next run to pair `collector` again.
    pub fn invalidate(&mut self, collector: &str) {
        self.paired.insert(collector.to_string(), false);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_topology(parties: usize) -> FleetTopology {
        let aggregator = Aggregator {
            identity: "user".to_string(),
            address: "127.0.0.1".to_string(),
            training_port: 7011,
            broadcast_port: 0,
        };
        let parties: Vec<Party> = (1..=parties)
            .map(|i| Party {
                identity: format!("rpi{}", i),
                address: format!("10.8.1.{}", 40 + i),
                signal_port: None,
            })
            .collect();
        let collectors = vec![PowerCollector {
            identity: "pi2".to_string(),
            address: "10.8.1.35".to_string(),
            party: "rpi1".to_string(),
            tester_address: "98:DA:F0:00:4A:13".to_string(),
            broadcast_port: None,
            serial_device: default_serial_device(),
        }];
        FleetTopology::new(aggregator, parties, collectors).unwrap()
    }

    #[test]
    fn collectors_inherit_broadcast_port() {
        let topology = sample_topology(2);
        assert_eq!(topology.collectors()[0].broadcast_port, Some(0));
    }

    #[test]
    fn roster_size_mismatch_is_reported() {
        let topology = sample_topology(4);
        assert!(topology.expect_parties(4).is_ok());
        let err = topology.expect_parties(5).unwrap_err();
        assert!(matches!(
            err,
            FleetError::ConfigMismatch {
                declared: 5,
                actual: 4
            }
        ));
    }

    #[test]
    fn collector_for_unknown_party_is_rejected() {
        let topology = sample_topology(1);
        let mut collector = topology.collectors()[0].clone();
        collector.party = "rpi9".to_string();
        let result = FleetTopology::new(
            topology.aggregator().clone(),
            topology.parties().to_vec(),
            vec![collector],
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_identities_are_rejected() {
        let topology = sample_topology(2);
        let mut parties = topology.parties().to_vec();
        parties.push(parties[0].clone());
        assert!(FleetTopology::new(topology.aggregator().clone(), parties, vec![]).is_err());
    }

    #[test]
    fn pairing_cache_defaults_to_unpaired() {
        let mut cache = PairingCache::new();
        assert!(!cache.is_paired("pi2"));
        cache.mark_paired("pi2");
        assert!(cache.is_paired("pi2"));
        cache.invalidate("pi2");
        assert!(!cache.is_paired("pi2"));
    }

    #[test]
    fn compute_devices_lists_aggregator_first() {
        let topology = sample_topology(3);
        let devices = topology.compute_devices();
        assert_eq!(devices.len(), 4);
        assert_eq!(devices[0].identity, "user");
    }
}
