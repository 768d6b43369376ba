//! Plan storage and layer directory loading.
//!
//! The store owns the current effective [`Plan`] and republishes it on
//! every change. Plans are immutable once published: readers clone an
//! `Arc` and never lock, writers swap the pointer under a write lock.

use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use regex::Regex;
use tracing::{debug, info};

use crate::{
    error::PlanError,
    plan::{self, Layer, Plan},
};

/// Callback invoked with every newly published plan.
pub type PlanSubscriber = Box<dyn Fn(&Arc<Plan>) + Send + Sync>;

/// Holds the current effective plan and notifies subscribers on change.
pub struct PlanStore {
    current: RwLock<Arc<Plan>>,
    subscribers: Mutex<Vec<PlanSubscriber>>,
}

impl Default for PlanStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanStore {
    /// Creates a store holding an empty plan.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Plan::default())),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The current effective plan.
    pub fn current(&self) -> Arc<Plan> {
        Arc::clone(&self.current.read().unwrap())
    }

    /// Registers a callback invoked on every plan replacement.
    pub fn subscribe(&self, subscriber: PlanSubscriber) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    /// Publishes a new plan and notifies subscribers.
    pub fn update(&self, new_plan: Plan) -> Arc<Plan> {
        let shared = Arc::new(new_plan);
        *self.current.write().unwrap() = Arc::clone(&shared);
        debug!(
            services = shared.services.len(),
            checks = shared.checks.len(),
            "published new plan"
        );
        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter() {
            subscriber(&shared);
        }
        shared
    }

    /// Reads, combines, and publishes the layers under `<dir>/layers/`.
    /// A missing layers directory is equivalent to an empty plan.
    pub fn load(&self, dir: &Path) -> Result<Arc<Plan>, PlanError> {
        let layers = read_layers_dir(dir)?;
        info!(dir = %dir.display(), layers = layers.len(), "loading plan");
        let combined = Plan::combine(layers)?;
        Ok(self.update(combined))
    }

    /// Appends a layer, or replaces the existing layer with the same
    /// label, then recombines and publishes.
    pub fn add_layer(&self, label: &str, yaml: &str) -> Result<Arc<Plan>, PlanError> {
        let current = self.current();
        let mut layers = current.layers.clone();

        let existing = layers.iter().position(|layer| layer.label == label);
        let order = match existing {
            Some(index) => layers[index].order,
            None => layers.last().map(|layer| layer.order + 1).unwrap_or(1),
        };
        let parsed = plan::parse_layer(order, label, yaml)?;
        match existing {
            Some(index) => layers[index] = parsed,
            None => layers.push(parsed),
        }

        let combined = Plan::combine(layers)?;
        Ok(self.update(combined))
    }
}

/// Reads and parses the layer files under `<dir>/layers/`, in ascending
/// order. Any file with a non-conforming name rejects the whole load.
fn read_layers_dir(dir: &Path) -> Result<Vec<Layer>, PlanError> {
    let layers_dir = dir.join("layers");
    if !layers_dir.exists() {
        return Ok(Vec::new());
    }

    let pattern = Regex::new(r"^([0-9]{3})-([a-z](?:-?[a-z0-9]){2,})\.yaml$")
        .expect("layer filename pattern is valid");

    let mut found: Vec<(i32, String, std::path::PathBuf)> = Vec::new();
    for entry in fs::read_dir(&layers_dir).map_err(PlanError::ReadError)? {
        let entry = entry.map_err(PlanError::ReadError)?;
        let file_type = entry.file_type().map_err(PlanError::ReadError)?;
        if file_type.is_dir() {
            continue;
        }

        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let captures = pattern.captures(&name).ok_or_else(|| {
            PlanError::format(format!(
                "invalid layer filename: \"{name}\" (must look like \"123-some-label.yaml\")"
            ))
        })?;

        let order: i32 = captures[1].parse().expect("three decimal digits");
        let label = captures[2].to_string();

        if found.iter().any(|(existing, _, _)| *existing == order) {
            return Err(PlanError::format(format!(
                "invalid layer filename: \"{name}\" (duplicate order {order})"
            )));
        }
        if found.iter().any(|(_, existing, _)| *existing == label) {
            return Err(PlanError::format(format!(
                "invalid layer filename: \"{name}\" (duplicate label \"{label}\")"
            )));
        }

        found.push((order, label, entry.path()));
    }

    found.sort_by_key(|(order, _, _)| *order);

    let mut layers = Vec::with_capacity(found.len());
    for (order, label, path) in found {
        let data = fs::read_to_string(&path).map_err(PlanError::ReadError)?;
        layers.push(plan::parse_layer(order, &label, &data)?);
    }
    Ok(layers)
}
