//! Plan data model and layer combination for warden.
//!
//! A plan is assembled from ordered configuration layers. Each layer is an
//! immutable fragment parsed from YAML; combining the layers in ascending
//! order and validating the result yields the effective [`Plan`] consumed by
//! the service and check managers.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};
use strum_macros::AsRefStr;

use crate::{
    constants::{
        DEFAULT_BACKOFF_DELAY, DEFAULT_BACKOFF_FACTOR, DEFAULT_BACKOFF_LIMIT,
        DEFAULT_CHECK_PERIOD, DEFAULT_CHECK_THRESHOLD, DEFAULT_CHECK_TIMEOUT,
        DEFAULT_KILL_DELAY, RESERVED_SERVICE_NAME,
    },
    error::PlanError,
    order,
};

/// A duration that remembers whether it was explicitly set.
///
/// Plan merging must distinguish "not specified" from "specified as the
/// default", so plain `Duration` fields are not enough. The YAML form is a
/// human-readable string such as `"500ms"` or `"10s"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionalDuration {
    value: Duration,
    is_set: bool,
}

impl OptionalDuration {
    /// Wraps an explicit duration.
    pub fn new(value: Duration) -> Self {
        Self {
            value,
            is_set: true,
        }
    }

    /// Whether the value was explicitly set.
    pub fn is_set(&self) -> bool {
        self.is_set
    }

    /// Inverse of [`OptionalDuration::is_set`], for serde skip attributes.
    pub fn is_unset(&self) -> bool {
        !self.is_set
    }

    /// Returns the set value, or `fallback` when unset.
    pub fn unwrap_or(&self, fallback: Duration) -> Duration {
        if self.is_set { self.value } else { fallback }
    }

    /// Returns the set value, if any.
    pub fn get(&self) -> Option<Duration> {
        self.is_set.then_some(self.value)
    }
}

impl Serialize for OptionalDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(self.value).to_string())
    }
}

impl<'de> Deserialize<'de> for OptionalDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DurationVisitor;

        impl serde::de::Visitor<'_> for DurationVisitor {
            type Value = OptionalDuration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string such as \"500ms\" or \"10s\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let parsed = humantime::parse_duration(value).map_err(|_| {
                    E::invalid_value(serde::de::Unexpected::Str(value), &self)
                })?;
                Ok(OptionalDuration::new(parsed))
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }
}

/// A float that remembers whether it was explicitly set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OptionalFloat {
    value: f64,
    is_set: bool,
}

impl OptionalFloat {
    /// Wraps an explicit value.
    pub fn new(value: f64) -> Self {
        Self {
            value,
            is_set: true,
        }
    }

    /// Whether the value was explicitly set.
    pub fn is_set(&self) -> bool {
        self.is_set
    }

    /// Inverse of [`OptionalFloat::is_set`], for serde skip attributes.
    pub fn is_unset(&self) -> bool {
        !self.is_set
    }

    /// Returns the set value, or `fallback` when unset.
    pub fn unwrap_or(&self, fallback: f64) -> f64 {
        if self.is_set { self.value } else { fallback }
    }

    /// Returns the set value, if any.
    pub fn get(&self) -> Option<f64> {
        self.is_set.then_some(self.value)
    }
}

impl Serialize for OptionalFloat {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.value)
    }
}

impl<'de> Deserialize<'de> for OptionalFloat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FloatVisitor;

        impl serde::de::Visitor<'_> for FloatVisitor {
            type Value = OptionalFloat;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a number")
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(OptionalFloat::new(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(OptionalFloat::new(value as f64))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(OptionalFloat::new(value as f64))
            }
        }

        deserializer.deserialize_any(FloatVisitor)
    }
}

/// Merge policy carried by every layer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Override {
    /// No policy given. Rejected during combination.
    #[default]
    Unknown,
    /// Deep-merge into the prior accumulated entry.
    Merge,
    /// Discard the prior entry entirely.
    Replace,
}

impl Override {
    /// Inverse of "was specified", for serde skip attributes.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Override::Unknown)
    }
}

impl Serialize for Override {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Override::Merge => serializer.serialize_str("merge"),
            Override::Replace => serializer.serialize_str("replace"),
            Override::Unknown => serializer.serialize_str(""),
        }
    }
}

impl<'de> Deserialize<'de> for Override {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct OverrideVisitor;

        impl serde::de::Visitor<'_> for OverrideVisitor {
            type Value = Override;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("\"merge\" or \"replace\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                match value {
                    "merge" => Ok(Override::Merge),
                    "replace" => Ok(Override::Replace),
                    _ => Err(E::invalid_value(serde::de::Unexpected::Str(value), &self)),
                }
            }
        }

        deserializer.deserialize_str(OverrideVisitor)
    }
}

/// Whether a service starts automatically when the plan is applied.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Startup {
    /// Not specified; treated as disabled.
    #[default]
    Unknown,
    /// The service starts when the plan is applied.
    Enabled,
    /// The service only starts on an explicit request.
    Disabled,
}

impl Startup {
    /// Inverse of "was specified", for serde skip attributes.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Startup::Unknown)
    }
}

/// Action taken when a service exits or one of its checks fails.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceAction {
    /// Not specified; behaves as [`ServiceAction::Restart`].
    #[default]
    Unset,
    /// Restart the service with backoff.
    Restart,
    /// Shut down the entire daemon.
    Shutdown,
    /// Do nothing; the service stays in its exited state.
    Ignore,
}

impl ServiceAction {
    /// Inverse of "was specified", for serde skip attributes.
    pub fn is_unset(&self) -> bool {
        matches!(self, ServiceAction::Unset)
    }
}

/// Health level a check contributes to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CheckLevel {
    /// Not associated with a level.
    #[default]
    Unset,
    /// Liveness: failing means the workload should be restarted.
    Alive,
    /// Readiness: failing means the workload cannot take traffic.
    Ready,
}

impl CheckLevel {
    /// Inverse of "was specified", for serde skip attributes.
    pub fn is_unset(&self) -> bool {
        matches!(self, CheckLevel::Unset)
    }
}

/// Configuration for a single supervised service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Service {
    /// Service name, filled from the map key after parsing.
    #[serde(skip)]
    pub name: String,

    /// Merge policy for this entry within its layer.
    #[serde(default, skip_serializing_if = "Override::is_unknown")]
    pub r#override: Override,

    /// One-line summary of the service.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,

    /// Longer free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Command to run, shell-split, with an optional trailing
    /// `[ default-args ]` group.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Whether the service starts automatically on plan apply.
    #[serde(default, skip_serializing_if = "Startup::is_unknown")]
    pub startup: Startup,

    /// Services that must be scheduled before this one. Ordering only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,

    /// Services that must be scheduled after this one. Ordering only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before: Vec<String>,

    /// Hard dependencies that must be running for this service to start.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Environment variables given to the service process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Numeric user ID to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,

    /// User name to run as.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Numeric group ID to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,

    /// Group name to run as.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    /// Working directory for the service process.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    /// Action when the service exits with code zero.
    #[serde(default, skip_serializing_if = "ServiceAction::is_unset")]
    pub on_success: ServiceAction,

    /// Action when the service exits non-zero or on a signal.
    #[serde(default, skip_serializing_if = "ServiceAction::is_unset")]
    pub on_failure: ServiceAction,

    /// Actions keyed by check name; the empty key sets a default for
    /// checks not named explicitly.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub on_check_failure: BTreeMap<String, ServiceAction>,

    /// Delay before the first restart of a failed service.
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub backoff_delay: OptionalDuration,

    /// Multiplier applied to the delay after each failure.
    #[serde(default, skip_serializing_if = "OptionalFloat::is_unset")]
    pub backoff_factor: OptionalFloat,

    /// Cap on the computed backoff delay.
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub backoff_limit: OptionalDuration,

    /// Grace period between SIGTERM and SIGKILL when stopping.
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub kill_delay: OptionalDuration,
}

impl Service {
    /// Deep-merges `other` into `self`: set scalars overwrite, sequences
    /// append, and maps union with the newer entry winning.
    pub fn merge_from(&mut self, other: &Service) {
        if !other.summary.is_empty() {
            self.summary = other.summary.clone();
        }
        if !other.description.is_empty() {
            self.description = other.description.clone();
        }
        if !other.command.is_empty() {
            self.command = other.command.clone();
        }
        if !other.startup.is_unknown() {
            self.startup = other.startup;
        }
        self.after.extend(other.after.iter().cloned());
        self.before.extend(other.before.iter().cloned());
        self.requires.extend(other.requires.iter().cloned());
        for (key, value) in &other.environment {
            self.environment.insert(key.clone(), value.clone());
        }
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        if !other.user.is_empty() {
            self.user = other.user.clone();
        }
        if other.group_id.is_some() {
            self.group_id = other.group_id;
        }
        if !other.group.is_empty() {
            self.group = other.group.clone();
        }
        if !other.working_dir.is_empty() {
            self.working_dir = other.working_dir.clone();
        }
        if !other.on_success.is_unset() {
            self.on_success = other.on_success;
        }
        if !other.on_failure.is_unset() {
            self.on_failure = other.on_failure;
        }
        for (check, action) in &other.on_check_failure {
            self.on_check_failure.insert(check.clone(), *action);
        }
        if other.backoff_delay.is_set() {
            self.backoff_delay = other.backoff_delay;
        }
        if other.backoff_factor.is_set() {
            self.backoff_factor = other.backoff_factor;
        }
        if other.backoff_limit.is_set() {
            self.backoff_limit = other.backoff_limit;
        }
        if other.kill_delay.is_set() {
            self.kill_delay = other.kill_delay;
        }
    }

    /// Splits the command into base and default arguments.
    pub fn command_args(&self) -> Result<(Vec<String>, Vec<String>), PlanError> {
        split_command(&self.command).map_err(|err| {
            PlanError::format(format!(
                "invalid command for service \"{}\": {err}",
                self.name
            ))
        })
    }

    /// Backoff delay, defaulted.
    pub fn effective_backoff_delay(&self) -> Duration {
        self.backoff_delay.unwrap_or(DEFAULT_BACKOFF_DELAY)
    }

    /// Backoff factor, defaulted.
    pub fn effective_backoff_factor(&self) -> f64 {
        self.backoff_factor.unwrap_or(DEFAULT_BACKOFF_FACTOR)
    }

    /// Backoff limit, defaulted. Doubles as the clean-run reset window.
    pub fn effective_backoff_limit(&self) -> Duration {
        self.backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT)
    }

    /// Kill delay, defaulted. A configured zero also falls back to the
    /// default rather than meaning "kill immediately".
    pub fn effective_kill_delay(&self) -> Duration {
        match self.kill_delay.get() {
            Some(delay) if !delay.is_zero() => delay,
            _ => DEFAULT_KILL_DELAY,
        }
    }

    /// Looks up the action for a failed check, falling back to the
    /// unnamed-check default when present.
    pub fn check_failure_action(&self, check_name: &str) -> ServiceAction {
        if let Some(action) = self.on_check_failure.get(check_name) {
            return *action;
        }
        self.on_check_failure
            .get("")
            .copied()
            .unwrap_or(ServiceAction::Unset)
    }
}

/// An HTTP health check probe: GET the URL, expect a 2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpCheck {
    /// URL to fetch.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Extra request headers.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl HttpCheck {
    fn merge_from(&mut self, other: &HttpCheck) {
        if !other.url.is_empty() {
            self.url = other.url.clone();
        }
        for (key, value) in &other.headers {
            self.headers.insert(key.clone(), value.clone());
        }
    }
}

/// A TCP health check probe: open a connection, then close it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TcpCheck {
    /// Port to connect to.
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,

    /// Host to connect to; defaults to "localhost".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

impl TcpCheck {
    fn merge_from(&mut self, other: &TcpCheck) {
        if other.port != 0 {
            self.port = other.port;
        }
        if !other.host.is_empty() {
            self.host = other.host.clone();
        }
    }
}

/// An exec health check probe: run a command, expect exit code zero.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ExecCheck {
    /// Command to run, shell-split.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,

    /// Environment given to the command. Nothing else is inherited.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,

    /// Numeric user ID to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u32>,

    /// User name to run as.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    /// Numeric group ID to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u32>,

    /// Group name to run as.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    /// Working directory for the command.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
}

impl ExecCheck {
    fn merge_from(&mut self, other: &ExecCheck) {
        if !other.command.is_empty() {
            self.command = other.command.clone();
        }
        for (key, value) in &other.environment {
            self.environment.insert(key.clone(), value.clone());
        }
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        if !other.user.is_empty() {
            self.user = other.user.clone();
        }
        if other.group_id.is_some() {
            self.group_id = other.group_id;
        }
        if !other.group.is_empty() {
            self.group = other.group.clone();
        }
        if !other.working_dir.is_empty() {
            self.working_dir = other.working_dir.clone();
        }
    }
}

/// Configuration for a single health check.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Check {
    /// Check name, filled from the map key after parsing.
    #[serde(skip)]
    pub name: String,

    /// Merge policy for this entry within its layer.
    #[serde(default, skip_serializing_if = "Override::is_unknown")]
    pub r#override: Override,

    /// Health level the check contributes to.
    #[serde(default, skip_serializing_if = "CheckLevel::is_unset")]
    pub level: CheckLevel,

    /// Interval between runs.
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub period: OptionalDuration,

    /// Per-run deadline. Must be less than the period.
    #[serde(default, skip_serializing_if = "OptionalDuration::is_unset")]
    pub timeout: OptionalDuration,

    /// Consecutive failures before the check goes down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,

    /// HTTP probe configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCheck>,

    /// TCP probe configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpCheck>,

    /// Exec probe configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecCheck>,
}

impl Check {
    /// Deep-merges `other` into `self`, recursing into probe structs.
    pub fn merge_from(&mut self, other: &Check) {
        if !other.level.is_unset() {
            self.level = other.level;
        }
        if other.period.is_set() {
            self.period = other.period;
        }
        if other.timeout.is_set() {
            self.timeout = other.timeout;
        }
        if other.threshold.is_some() {
            self.threshold = other.threshold;
        }
        if let Some(http) = &other.http {
            match &mut self.http {
                Some(existing) => existing.merge_from(http),
                None => self.http = Some(http.clone()),
            }
        }
        if let Some(tcp) = &other.tcp {
            match &mut self.tcp {
                Some(existing) => existing.merge_from(tcp),
                None => self.tcp = Some(tcp.clone()),
            }
        }
        if let Some(exec) = &other.exec {
            match &mut self.exec {
                Some(existing) => existing.merge_from(exec),
                None => self.exec = Some(exec.clone()),
            }
        }
    }

    /// Period, defaulted.
    pub fn effective_period(&self) -> Duration {
        self.period.unwrap_or(DEFAULT_CHECK_PERIOD)
    }

    /// Timeout, defaulted.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_CHECK_TIMEOUT)
    }

    /// Threshold, defaulted.
    pub fn effective_threshold(&self) -> u32 {
        self.threshold.unwrap_or(DEFAULT_CHECK_THRESHOLD)
    }
}

/// Destination for service logs. Parsed and merged like the other entries;
/// shipping the logs is the concern of an outer layer, not the core.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LogTarget {
    /// Target name, filled from the map key after parsing.
    #[serde(skip)]
    pub name: String,

    /// Merge policy for this entry within its layer.
    #[serde(default, skip_serializing_if = "Override::is_unknown")]
    pub r#override: Override,

    /// Target type identifier (e.g. "loki").
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub target_type: String,

    /// Destination address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,

    /// Services whose output is forwarded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

impl LogTarget {
    fn merge_from(&mut self, other: &LogTarget) {
        if !other.target_type.is_empty() {
            self.target_type = other.target_type.clone();
        }
        if !other.location.is_empty() {
            self.location = other.location.clone();
        }
        self.services.extend(other.services.iter().cloned());
    }
}

/// One immutable configuration fragment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Layer {
    /// Position of the layer within the plan, from the file-name prefix.
    #[serde(skip)]
    pub order: i32,

    /// Unique layer label, from the file name.
    #[serde(skip)]
    pub label: String,

    /// One-line summary of the layer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,

    /// Longer free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Service entries keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,

    /// Check entries keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, Check>,

    /// Log target entries keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub log_targets: BTreeMap<String, LogTarget>,
}

impl Layer {
    /// Serialises the layer back to YAML.
    pub fn to_yaml(&self) -> Result<String, PlanError> {
        serde_yaml::to_string(self).map_err(PlanError::ParseError)
    }
}

/// Parses a layer from YAML, stamping its order and label and copying map
/// keys into the entry `name` fields.
pub fn parse_layer(order: i32, label: &str, data: &str) -> Result<Layer, PlanError> {
    let mut layer: Layer = serde_yaml::from_str(data).map_err(PlanError::ParseError)?;
    layer.order = order;
    layer.label = label.to_string();

    for (name, service) in layer.services.iter_mut() {
        if name.is_empty() {
            return Err(PlanError::format(format!(
                "cannot use empty service name in layer \"{label}\""
            )));
        }
        if name == RESERVED_SERVICE_NAME {
            return Err(PlanError::format(format!(
                "cannot use reserved service name \"{RESERVED_SERVICE_NAME}\""
            )));
        }
        service.name = name.clone();
    }
    for (name, check) in layer.checks.iter_mut() {
        if name.is_empty() {
            return Err(PlanError::format(format!(
                "cannot use empty check name in layer \"{label}\""
            )));
        }
        check.name = name.clone();
    }
    for (name, target) in layer.log_targets.iter_mut() {
        if name.is_empty() {
            return Err(PlanError::format(format!(
                "cannot use empty log target name in layer \"{label}\""
            )));
        }
        target.name = name.clone();
    }

    Ok(layer)
}

/// The validated combination of all current layers. Immutable once
/// published; replaced wholesale on configuration changes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Plan {
    /// The layers the plan was combined from, in ascending order.
    #[serde(skip)]
    pub layers: Vec<Layer>,

    /// Effective service configurations.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,

    /// Effective check configurations.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, Check>,

    /// Effective log target configurations.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub log_targets: BTreeMap<String, LogTarget>,
}

impl Plan {
    /// Combines layers in ascending order and validates the result.
    pub fn combine(layers: Vec<Layer>) -> Result<Plan, PlanError> {
        let mut services: BTreeMap<String, Service> = BTreeMap::new();
        let mut checks: BTreeMap<String, Check> = BTreeMap::new();
        let mut log_targets: BTreeMap<String, LogTarget> = BTreeMap::new();

        for layer in &layers {
            for (name, service) in &layer.services {
                match service.r#override {
                    Override::Merge => {
                        if let Some(existing) = services.get_mut(name) {
                            existing.merge_from(service);
                        } else {
                            services.insert(name.clone(), service.clone());
                        }
                    }
                    Override::Replace => {
                        services.insert(name.clone(), service.clone());
                    }
                    Override::Unknown => {
                        return Err(PlanError::format(format!(
                            "layer \"{}\" must define \"override\" for service \"{name}\"",
                            layer.label
                        )));
                    }
                }
            }
            for (name, check) in &layer.checks {
                match check.r#override {
                    Override::Merge => {
                        if let Some(existing) = checks.get_mut(name) {
                            existing.merge_from(check);
                        } else {
                            checks.insert(name.clone(), check.clone());
                        }
                    }
                    Override::Replace => {
                        checks.insert(name.clone(), check.clone());
                    }
                    Override::Unknown => {
                        return Err(PlanError::format(format!(
                            "layer \"{}\" must define \"override\" for check \"{name}\"",
                            layer.label
                        )));
                    }
                }
            }
            for (name, target) in &layer.log_targets {
                match target.r#override {
                    Override::Merge => {
                        if let Some(existing) = log_targets.get_mut(name) {
                            existing.merge_from(target);
                        } else {
                            log_targets.insert(name.clone(), target.clone());
                        }
                    }
                    Override::Replace => {
                        log_targets.insert(name.clone(), target.clone());
                    }
                    Override::Unknown => {
                        return Err(PlanError::format(format!(
                            "layer \"{}\" must define \"override\" for log target \"{name}\"",
                            layer.label
                        )));
                    }
                }
            }
        }

        let plan = Plan {
            layers,
            services,
            checks,
            log_targets,
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Validates the combined plan. Errors are [`PlanError::Format`] and
    /// carry operator-readable messages.
    pub fn validate(&self) -> Result<(), PlanError> {
        for (name, service) in &self.services {
            if service.command.is_empty() {
                return Err(PlanError::format(format!(
                    "plan must define \"command\" for service \"{name}\""
                )));
            }
            service.command_args()?;

            let factor = service.effective_backoff_factor();
            if factor < 1.0 {
                return Err(PlanError::format(format!(
                    "backoff-factor must be 1.0 or greater for service \"{name}\", not {factor}"
                )));
            }

            for relation in [&service.requires, &service.after, &service.before] {
                for other in relation {
                    if !self.services.contains_key(other) {
                        return Err(PlanError::format(format!(
                            "service \"{name}\" refers to undefined service \"{other}\""
                        )));
                    }
                }
            }
        }

        // Any before/after loop surfaces here as an ordering error.
        let names: Vec<String> = self.services.keys().cloned().collect();
        order::start_order(&self.services, &names)?;

        for (name, check) in &self.checks {
            let period = check.effective_period();
            if period.is_zero() {
                return Err(PlanError::format(format!(
                    "plan check \"{name}\" period must not be zero"
                )));
            }
            let timeout = check.effective_timeout();
            if timeout.is_zero() {
                return Err(PlanError::format(format!(
                    "plan check \"{name}\" timeout must not be zero"
                )));
            }
            if timeout >= period {
                return Err(PlanError::format(format!(
                    "plan check \"{name}\" timeout must be less than period"
                )));
            }
            if let Some(0) = check.threshold {
                return Err(PlanError::format(format!(
                    "plan check \"{name}\" threshold must not be zero"
                )));
            }

            let mut kinds = 0;
            if check.http.is_some() {
                kinds += 1;
            }
            if check.tcp.is_some() {
                kinds += 1;
            }
            if check.exec.is_some() {
                kinds += 1;
            }
            if kinds != 1 {
                return Err(PlanError::format(format!(
                    "plan must specify exactly one of \"http\", \"tcp\", or \"exec\" for check \"{name}\""
                )));
            }

            if let Some(http) = &check.http
                && http.url.is_empty()
            {
                return Err(PlanError::format(format!(
                    "plan must set \"url\" for http check \"{name}\""
                )));
            }
            if let Some(tcp) = &check.tcp
                && tcp.port == 0
            {
                return Err(PlanError::format(format!(
                    "plan must set \"port\" for tcp check \"{name}\""
                )));
            }
            if let Some(exec) = &check.exec {
                if exec.command.is_empty() {
                    return Err(PlanError::format(format!(
                        "plan must set \"command\" for exec check \"{name}\""
                    )));
                }
                if shlex::split(&exec.command).is_none() {
                    return Err(PlanError::format(format!(
                        "plan check \"{name}\" command is not parseable"
                    )));
                }
                crate::privilege::validate_user_group(
                    exec.user_id,
                    &exec.user,
                    exec.group_id,
                    &exec.group,
                )
                .map_err(|err| {
                    PlanError::format(format!("plan check \"{name}\": {err}"))
                })?;
            }
        }

        Ok(())
    }

    /// Serialises the effective plan to YAML.
    pub fn to_yaml(&self) -> Result<String, PlanError> {
        serde_yaml::to_string(self).map_err(PlanError::ParseError)
    }
}

/// Splits a command string into base arguments and the optional
/// `[ default-args ]` group.
///
/// The brackets must be standalone tokens: the group may not be the first
/// token, may not nest, and must end the command.
pub fn split_command(command: &str) -> Result<(Vec<String>, Vec<String>), PlanError> {
    let args = shlex::split(command)
        .ok_or_else(|| PlanError::format("cannot parse command".to_string()))?;
    if args.is_empty() {
        return Err(PlanError::format("no command tokens".to_string()));
    }

    let open = args.iter().position(|token| token == "[");
    match open {
        None => {
            if args.iter().any(|token| token == "]") {
                return Err(PlanError::format(
                    "cannot have \"]\" without a preceding \"[\"".to_string(),
                ));
            }
            Ok((args, Vec::new()))
        }
        Some(0) => Err(PlanError::format(
            "cannot start command with \"[\"".to_string(),
        )),
        Some(open) => {
            let mut close = None;
            for (index, token) in args.iter().enumerate().skip(open + 1) {
                match token.as_str() {
                    "[" => {
                        return Err(PlanError::format(
                            "cannot nest \"[ ... ]\" groups".to_string(),
                        ));
                    }
                    "]" => {
                        close = Some(index);
                        break;
                    }
                    _ => {}
                }
            }
            let close = close.ok_or_else(|| {
                PlanError::format("cannot have \"[\" without a closing \"]\"".to_string())
            })?;
            if close != args.len() - 1 {
                return Err(PlanError::format(
                    "cannot have tokens after \"]\"".to_string(),
                ));
            }
            let base = args[..open].to_vec();
            let extra = args[open + 1..close].to_vec();
            Ok((base, extra))
        }
    }
}
