use crate::classify::{Classifier, Lvap, LvapTable};
use crate::scheduler::{QosScheduler, TrafficClassKey};
use crate::Error;
use color_eyre::eyre::{ensure, eyre, Report, WrapErr};
use yaml_rust::{yaml::Hash, Yaml};

pub const DEFAULT_CAPACITY: usize = 500;
pub const DEFAULT_QUANTUM: usize = 1470;

/// Startup parameters of a [`QosScheduler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Frames each station queue can hold.
    pub capacity: usize,
    /// Bytes of credit a traffic class receives per DRR round unless provisioned otherwise.
    pub default_quantum: usize,
    /// Log queue creation at `info` and every dispatch at `debug`.
    pub debug: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            default_quantum: DEFAULT_QUANTUM,
            debug: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), Report> {
        check_class_params(self.capacity, self.default_quantum)
    }
}

pub(crate) fn check_class_params(capacity: usize, quantum: usize) -> Result<(), Report> {
    ensure!(
        capacity > 0,
        Error::Config(format!("capacity must be positive, got {}", capacity))
    );
    ensure!(
        quantum > 0,
        Error::Config(format!("quantum must be positive, got {}", quantum))
    );
    Ok(())
}

pub(crate) fn check_dscp(dscp: u8) -> Result<(), Report> {
    ensure!(
        dscp < 64,
        Error::Config(format!("dscp must be in 0..=63, got {}", dscp))
    );
    Ok(())
}

/// A traffic class created before any of its traffic arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficRule {
    pub key: TrafficClassKey,
    pub quantum: usize,
    /// Per-station capacity; the scheduler default if `None`.
    pub capacity: Option<usize>,
}

/// Scheduler parameters, provisioned traffic rules and the LVAP table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QosConfig {
    pub scheduler: SchedulerConfig,
    pub rules: Vec<TrafficRule>,
    pub lvaps: Vec<Lvap>,
}

fn take(node: &mut Hash, key: &str) -> Option<Yaml> {
    node.remove(&Yaml::String(key.to_owned()))
}

fn take_uint(node: &mut Hash, key: &str) -> Result<Option<usize>, Report> {
    take(node, key)
        .map(|v| {
            let v = v
                .into_i64()
                .ok_or_else(|| eyre!("{} must be an integer", key))?;
            ensure!(v >= 0, "{} must not be negative", key);
            Ok(v as usize)
        })
        .transpose()
}

fn take_string(node: &mut Hash, key: &str) -> Result<String, Report> {
    take(node, key)
        .ok_or_else(|| eyre!("Need {} key", key))?
        .into_string()
        .ok_or_else(|| eyre!("{} must be a string", key))
}

fn take_list(node: &mut Hash, key: &str) -> Result<Vec<Yaml>, Report> {
    match take(node, key) {
        None | Some(Yaml::Null) => Ok(Vec::new()),
        Some(v) => v
            .into_vec()
            .ok_or_else(|| eyre!("{} must be a list", key)),
    }
}

fn rule_from_yaml(yaml: Yaml) -> Result<TrafficRule, Report> {
    let mut node = yaml
        .into_hash()
        .ok_or_else(|| eyre!("Rule must be dictionary"))?;
    let ssid = take_string(&mut node, "ssid")?;
    let dscp = take_uint(&mut node, "dscp")?.ok_or_else(|| eyre!("Need dscp key"))?;
    ensure!(
        dscp < 64,
        Error::Config(format!("dscp must be in 0..=63, got {}", dscp))
    );
    let quantum = take_uint(&mut node, "quantum")?.ok_or_else(|| eyre!("Need quantum key"))?;
    let capacity = take_uint(&mut node, "capacity")?;
    check_class_params(capacity.unwrap_or(DEFAULT_CAPACITY), quantum)?;
    Ok(TrafficRule {
        key: TrafficClassKey::new(ssid, dscp as u8),
        quantum,
        capacity,
    })
}

fn lvap_from_yaml(yaml: Yaml) -> Result<Lvap, Report> {
    let mut node = yaml
        .into_hash()
        .ok_or_else(|| eyre!("Lvap must be dictionary"))?;
    Ok(Lvap {
        sta: take_string(&mut node, "sta")?.parse()?,
        bssid: take_string(&mut node, "bssid")?.parse()?,
        ssid: take_string(&mut node, "ssid")?,
    })
}

impl QosConfig {
    /// Load `QosConfig` from yaml config file.
    ///
    /// # Example
    /// ```yaml
    /// capacity: 500
    /// default_quantum: 1470
    /// debug: false
    /// rules:
    ///   - ssid: tenant-a
    ///     dscp: 46
    ///     quantum: 3000
    ///     capacity: 200
    /// lvaps:
    ///   - sta: "00:11:22:33:44:55"
    ///     bssid: "02:aa:00:00:00:01"
    ///     ssid: tenant-a
    /// ```
    pub fn from_file(file: impl AsRef<std::path::Path>) -> Result<Self, Report> {
        let cfg_str = std::fs::read_to_string(file.as_ref())
            .wrap_err(eyre!("Could not read {:?}", file.as_ref()))?;
        Self::from_str(&cfg_str)
    }

    pub fn from_str(cfg: &str) -> Result<Self, Report> {
        let yaml =
            yaml_rust::YamlLoader::load_from_str(cfg).wrap_err(eyre!("Error reading {:?}", cfg))?;
        ensure!(yaml.len() <= 1, "Config needs at most one document");
        let mut node = match yaml.into_iter().next() {
            None | Some(Yaml::Null) => return Ok(Self::default()),
            Some(doc) => doc
                .into_hash()
                .ok_or_else(|| eyre!("Need dictionary structure"))?,
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            capacity: take_uint(&mut node, "capacity")?.unwrap_or(defaults.capacity),
            default_quantum: take_uint(&mut node, "default_quantum")?
                .unwrap_or(defaults.default_quantum),
            debug: match take(&mut node, "debug") {
                None => defaults.debug,
                Some(v) => v.as_bool().ok_or_else(|| eyre!("debug must be a bool"))?,
            },
        };
        scheduler.validate()?;

        let rules = take_list(&mut node, "rules")?
            .into_iter()
            .map(rule_from_yaml)
            .collect::<Result<_, Report>>()
            .wrap_err("invalid traffic rule")?;
        let lvaps = take_list(&mut node, "lvaps")?
            .into_iter()
            .map(lvap_from_yaml)
            .collect::<Result<_, Report>>()
            .wrap_err("invalid lvap")?;

        Ok(Self {
            scheduler,
            rules,
            lvaps,
        })
    }

    pub fn lvap_table(&self) -> LvapTable {
        LvapTable::new(self.lvaps.iter().cloned())
    }

    /// Build a scheduler with every traffic rule provisioned.
    pub fn build<C: Classifier>(&self, classifier: C) -> Result<QosScheduler<C>, Report> {
        let s = QosScheduler::new(self.scheduler, classifier)?;
        for r in &self.rules {
            s.provision_with(
                r.key.clone(),
                r.quantum,
                r.capacity.unwrap_or(self.scheduler.capacity),
            )
            .wrap_err(eyre!("provisioning {}", r.key))?;
        }

        Ok(s)
    }
}

#[cfg(test)]
mod t {
    use super::{QosConfig, SchedulerConfig};
    use crate::scheduler::TrafficClassKey;
    use crate::t::init;
    use crate::Error;

    const CFG: &str = "\
capacity: 64
default_quantum: 1000
debug: true
rules:
  - ssid: tenant-a
    dscp: 46
    quantum: 3000
    capacity: 16
  - ssid: tenant-b
    dscp: 0
    quantum: 500
lvaps:
  - sta: \"00:11:22:33:44:55\"
    bssid: \"02:aa:00:00:00:01\"
    ssid: tenant-a
";

    #[test]
    fn parse_yaml() {
        init();
        let cfg = QosConfig::from_str(CFG).unwrap();
        dbg!(&cfg);
        assert_eq!(
            cfg.scheduler,
            SchedulerConfig {
                capacity: 64,
                default_quantum: 1000,
                debug: true,
            }
        );
        assert_eq!(cfg.rules.len(), 2);
        assert_eq!(cfg.rules[0].key, TrafficClassKey::new("tenant-a", 46));
        assert_eq!(cfg.rules[0].quantum, 3000);
        assert_eq!(cfg.rules[0].capacity, Some(16));
        assert_eq!(cfg.rules[1].capacity, None);
        assert_eq!(cfg.lvaps.len(), 1);
        assert_eq!(cfg.lvaps[0].sta.to_string(), "00:11:22:33:44:55");
        assert_eq!(cfg.lvap_table().len(), 1);
    }

    #[test]
    fn defaults() {
        init();
        assert_eq!(QosConfig::from_str("").unwrap(), QosConfig::default());
        let cfg = QosConfig::from_str("debug: false\n").unwrap();
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
        assert!(cfg.rules.is_empty());
    }

    #[test]
    fn rejects_bad_values() {
        init();
        let err = QosConfig::from_str("capacity: 0\n").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config(_))));
        QosConfig::from_str("default_quantum: 0\n").unwrap_err();
        QosConfig::from_str("capacity: -3\n").unwrap_err();
        QosConfig::from_str("rules:\n  - ssid: a\n    dscp: 64\n    quantum: 10\n").unwrap_err();
        QosConfig::from_str("rules:\n  - ssid: a\n    dscp: 1\n    quantum: 0\n").unwrap_err();
        QosConfig::from_str("rules:\n  - ssid: a\n    quantum: 10\n").unwrap_err();
        QosConfig::from_str("lvaps:\n  - sta: \"00:11\"\n    bssid: \"02:aa:00:00:00:01\"\n    ssid: a\n")
            .unwrap_err();
    }

    #[test]
    fn build_provisions_rules() {
        init();
        let cfg = QosConfig::from_str(CFG).unwrap();
        let s = cfg.build(cfg.lvap_table()).unwrap();
        let r = s.report();
        assert_eq!(r.classes.len(), 2);
        assert_eq!(r.classes[0].key, TrafficClassKey::new("tenant-a", 46));
        assert_eq!(r.classes[0].quantum, 3000);
        assert_eq!(r.classes[0].capacity, 16);
        assert_eq!(r.classes[1].capacity, 64);
    }
}
