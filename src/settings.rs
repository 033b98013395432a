//! Host settings: hosts, booking links and weekly availability rules, loaded
//! from a TOML file and served read-only through [`InMemoryStore`].

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono_tz::Tz;
use dashmap::DashMap;
use serde::Deserialize;

use crate::adapters::AvailabilityStore;
use crate::limits::*;
use crate::model::*;

#[derive(Debug)]
pub enum SettingsError {
    Read(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Read(e) => write!(f, "failed to read settings file: {e}"),
            SettingsError::Parse(e) => write!(f, "failed to parse settings: {e}"),
            SettingsError::Invalid(msg) => write!(f, "invalid settings: {msg}"),
        }
    }
}

impl std::error::Error for SettingsError {}

/// A rule as written in the settings file. `timezone` defaults to the host's.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub host_id: HostId,
    pub day_of_week: u8,
    pub start_time: LocalTime,
    pub end_time: LocalTime,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
    #[serde(default)]
    pub links: Vec<BookingLink>,
}

fn invalid(msg: String) -> SettingsError {
    SettingsError::Invalid(msg)
}

fn check_timezone(tz: &str, owner: &str) -> Result<(), SettingsError> {
    tz.parse::<Tz>()
        .map(|_| ())
        .map_err(|_| invalid(format!("{owner}: unknown timezone {tz:?}")))
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(SettingsError::Read)?;
        content.parse()
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let mut host_ids = HashSet::new();
        for host in &self.hosts {
            if !host_ids.insert(host.id.as_str()) {
                return Err(invalid(format!("duplicate host id {:?}", host.id)));
            }
            check_timezone(&host.timezone, &format!("host {}", host.id))?;
        }

        for (i, rule) in self.rules.iter().enumerate() {
            let owner = format!("rule #{i} ({})", rule.host_id);
            if !host_ids.contains(rule.host_id.as_str()) {
                return Err(invalid(format!("{owner}: unknown host")));
            }
            if rule.day_of_week > 6 {
                return Err(invalid(format!("{owner}: day_of_week must be 0-6")));
            }
            if rule.start_time >= rule.end_time {
                return Err(invalid(format!("{owner}: start_time must be before end_time")));
            }
            if let Some(tz) = &rule.timezone {
                check_timezone(tz, &owner)?;
            }
        }

        let mut slugs = HashSet::new();
        for link in &self.links {
            if link.slug.is_empty() || link.slug.len() > MAX_SLUG_LEN {
                return Err(invalid(format!("link slug {:?} is empty or too long", link.slug)));
            }
            if !slugs.insert(link.slug.as_str()) {
                return Err(invalid(format!("duplicate link slug {:?}", link.slug)));
            }
            if !host_ids.contains(link.host_id.as_str()) {
                return Err(invalid(format!("link {}: unknown host {:?}", link.slug, link.host_id)));
            }
            if link.duration_minutes == 0 || link.duration_minutes > MAX_DURATION_MINUTES {
                return Err(invalid(format!(
                    "link {}: duration_minutes must be 1-{MAX_DURATION_MINUTES}",
                    link.slug
                )));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for Settings {
    type Err = SettingsError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let settings: Settings = toml::from_str(content).map_err(SettingsError::Parse)?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Settings held in memory. Readers never block each other.
pub struct InMemoryStore {
    hosts: DashMap<HostId, Host>,
    links: DashMap<String, BookingLink>,
    rules: DashMap<HostId, Vec<AvailabilityRule>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
            links: DashMap::new(),
            rules: DashMap::new(),
        }
    }

    pub fn from_settings(settings: Settings) -> Self {
        let store = Self::new();
        for host in settings.hosts {
            store.insert_host(host);
        }
        for entry in settings.rules {
            let timezone = match entry.timezone {
                Some(tz) => tz,
                None => store
                    .hosts
                    .get(&entry.host_id)
                    .map(|h| h.timezone.clone())
                    .unwrap_or_else(|| "UTC".into()),
            };
            store.insert_rule(
                &entry.host_id,
                AvailabilityRule {
                    day_of_week: entry.day_of_week,
                    start_time: entry.start_time,
                    end_time: entry.end_time,
                    timezone,
                    active: entry.active,
                },
            );
        }
        for link in settings.links {
            store.insert_link(link);
        }
        store
    }

    pub fn insert_host(&self, host: Host) {
        self.hosts.insert(host.id.clone(), host);
    }

    pub fn insert_rule(&self, host_id: &str, rule: AvailabilityRule) {
        self.rules.entry(host_id.to_string()).or_default().push(rule);
    }

    pub fn insert_link(&self, link: BookingLink) {
        self.links.insert(link.slug.clone(), link);
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

#[async_trait]
impl AvailabilityStore for InMemoryStore {
    async fn booking_link(&self, slug: &str) -> Option<BookingLink> {
        self.links.get(slug).map(|e| e.value().clone())
    }

    async fn host(&self, host_id: &str) -> Option<Host> {
        self.hosts.get(host_id).map(|e| e.value().clone())
    }

    async fn list_rules(&self, host_id: &str) -> Vec<AvailabilityRule> {
        self.rules
            .get(host_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}
