//! Engine Configuration
//!
//! Defines the configuration for a scoring run including:
//! - Teams (IDs assigned 1-based in file order) and their checks
//! - Round cadence (base delay + jitter) and per-check timeout
//! - SLA threshold and credential rotation cadence
//! - Timezone used to interpret local times in the injects file
//!
//! A malformed configuration is the only fatal error in the engine.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use crate::error::{Result, ScoreError};
use crate::types::{CheckSpec, NewInject, Team};

/// Default base delay between rounds (seconds)
pub const DEFAULT_DELAY_SECS: u64 = 60;

/// Default maximum random jitter added to the delay (seconds)
pub const DEFAULT_JITTER_SECS: u64 = 30;

/// Default per-check timeout (seconds)
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 10;

/// Default consecutive failures that make up an SLA violation
pub const DEFAULT_SLA_THRESHOLD: u32 = 3;

fn default_delay() -> u64 {
    DEFAULT_DELAY_SECS
}

fn default_jitter() -> u64 {
    DEFAULT_JITTER_SECS
}

fn default_check_timeout() -> u64 {
    DEFAULT_CHECK_TIMEOUT_SECS
}

fn default_sla_threshold() -> u32 {
    DEFAULT_SLA_THRESHOLD
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base delay between rounds in seconds
    #[serde(default = "default_delay")]
    pub delay: u64,
    /// Maximum jitter added to the delay in seconds
    #[serde(default = "default_jitter")]
    pub jitter: u64,
    /// Per-check timeout in seconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,
    /// Consecutive failures that count as one SLA violation
    #[serde(default = "default_sla_threshold")]
    pub sla_threshold: u32,
    /// Rotate credentials every N rounds (0 = on demand only)
    #[serde(default)]
    pub rotate_every: u64,
    /// IANA zone name (`America/Chicago`), `UTC`, or a fixed `+HH:MM` offset
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Enable persistence token scoring
    #[serde(default)]
    pub persists: bool,
    /// Skip the default password-change inject
    #[serde(default)]
    pub no_passwords: bool,
    /// Let teams change service passwords themselves
    #[serde(default)]
    pub easy_pcr: bool,
    /// Teams in scoring order
    #[serde(default, rename = "team")]
    pub teams: Vec<TeamConfig>,
}

/// One `[[team]]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    pub name: String,
    /// Fixed persistence token; generated when absent
    #[serde(default)]
    pub persist_token: Option<String>,
    #[serde(default, rename = "check")]
    pub checks: Vec<CheckSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY_SECS,
            jitter: DEFAULT_JITTER_SECS,
            check_timeout: DEFAULT_CHECK_TIMEOUT_SECS,
            sla_threshold: DEFAULT_SLA_THRESHOLD,
            rotate_every: 0,
            timezone: default_timezone(),
            persists: false,
            no_passwords: false,
            easy_pcr: false,
            teams: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Read, parse and validate a TOML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScoreError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML configuration string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| ScoreError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the team/check list and numeric settings
    pub fn validate(&self) -> Result<()> {
        if self.teams.is_empty() {
            return Err(ScoreError::Configuration("no teams configured".to_string()));
        }
        if self.delay == 0 {
            return Err(ScoreError::Configuration("delay must be positive".to_string()));
        }
        if self.check_timeout == 0 {
            return Err(ScoreError::Configuration(
                "check_timeout must be positive".to_string(),
            ));
        }
        if self.sla_threshold == 0 {
            return Err(ScoreError::Configuration(
                "sla_threshold must be positive".to_string(),
            ));
        }
        self.inject_timezone()?;

        let mut team_names = HashSet::new();
        let mut tokens = HashSet::new();
        for team in &self.teams {
            if team.name.trim().is_empty() {
                return Err(ScoreError::Configuration("team with empty name".to_string()));
            }
            if !team_names.insert(team.name.as_str()) {
                return Err(ScoreError::Configuration(format!(
                    "duplicate team name: {}",
                    team.name
                )));
            }
            if let Some(token) = &team.persist_token {
                if token.trim().is_empty() {
                    return Err(ScoreError::Configuration(format!(
                        "team {} has an empty persist_token",
                        team.name
                    )));
                }
                if !tokens.insert(token.as_str()) {
                    return Err(ScoreError::Configuration(format!(
                        "team {} reuses another team's persist_token",
                        team.name
                    )));
                }
            }

            let mut check_names = HashSet::new();
            for check in &team.checks {
                if check.name.trim().is_empty() {
                    return Err(ScoreError::Configuration(format!(
                        "team {} has a check with an empty name",
                        team.name
                    )));
                }
                if !check_names.insert(check.name.as_str()) {
                    return Err(ScoreError::Configuration(format!(
                        "team {} has duplicate check: {}",
                        team.name, check.name
                    )));
                }
                if check.target.trim().is_empty() {
                    return Err(ScoreError::Configuration(format!(
                        "check {}/{} has an empty target",
                        team.name, check.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build the in-memory teams, assigning IDs 1-based in file order
    pub fn teams(&self) -> Vec<Team> {
        self.teams
            .iter()
            .enumerate()
            .map(|(i, team)| Team {
                id: (i + 1) as u32,
                name: team.name.clone(),
                checks: team.checks.clone(),
                persist_token: team.persist_token.clone(),
            })
            .collect()
    }

    /// Parsed timezone for local inject times
    pub fn inject_timezone(&self) -> Result<InjectTimezone> {
        parse_timezone(&self.timezone)
    }
}

/// Zone used to read local inject times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectTimezone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl InjectTimezone {
    /// Resolve a local wall-clock time. An ambiguous time (DST fall-back)
    /// takes the earlier instant; a skipped one yields `None`.
    pub fn to_utc(&self, local: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Self::Named(tz) => tz
                .from_local_datetime(local)
                .earliest()
                .map(|t| t.with_timezone(&Utc)),
            Self::Fixed(offset) => offset
                .from_local_datetime(local)
                .single()
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

/// Parse an IANA zone name, `UTC`, `Z`, or a `+HH:MM` / `-HH:MM` offset
pub fn parse_timezone(raw: &str) -> Result<InjectTimezone> {
    let raw = raw.trim();
    if let Ok(tz) = raw.parse::<Tz>() {
        return Ok(InjectTimezone::Named(tz));
    }
    parse_fixed_offset(raw).map(InjectTimezone::Fixed)
}

fn parse_fixed_offset(raw: &str) -> Result<FixedOffset> {
    let invalid = || ScoreError::Configuration(format!("invalid timezone: {:?}", raw));

    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(invalid());
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

// ============================================================================
// Injects file
// ============================================================================

#[derive(Debug, Deserialize)]
struct InjectFile {
    #[serde(default, rename = "inject")]
    injects: Vec<InjectEntry>,
}

#[derive(Debug, Deserialize)]
struct InjectEntry {
    title: String,
    body: String,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    deadline: Option<String>,
}

/// Parse an inject time: RFC 3339, or `YYYY-MM-DD HH:MM[:SS]` in `zone`
pub fn parse_inject_time(raw: &str, zone: InjectTimezone) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M"))
        .map_err(|e| ScoreError::Configuration(format!("invalid inject time {:?}: {}", raw, e)))?;

    zone.to_utc(&naive).ok_or_else(|| {
        ScoreError::Configuration(format!("inject time {:?} does not exist locally", raw))
    })
}

/// Parse an injects TOML document. Injects without a `time` publish at `now`.
pub fn parse_injects(
    content: &str,
    zone: InjectTimezone,
    now: DateTime<Utc>,
) -> Result<Vec<NewInject>> {
    let file: InjectFile = toml::from_str(content)
        .map_err(|e| ScoreError::Configuration(format!("invalid injects file: {}", e)))?;

    file.injects
        .into_iter()
        .map(|entry| {
            let time = match entry.time.as_deref() {
                Some(raw) => parse_inject_time(raw, zone)?,
                None => now,
            };
            let deadline = entry
                .deadline
                .as_deref()
                .map(|raw| parse_inject_time(raw, zone))
                .transpose()?;
            Ok(NewInject {
                time,
                title: entry.title,
                body: entry.body,
                deadline,
            })
        })
        .collect()
}

/// Load the injects file if it exists. A missing file yields no injects.
pub fn load_injects_file<P: AsRef<Path>>(path: P, zone: InjectTimezone) -> Result<Vec<NewInject>> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(content) => parse_injects(&content, zone, Utc::now()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("Injects file {} not found, skipping", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(ScoreError::Configuration(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}
