//! Target registry: the configured matrixes, resolved against the probe modules.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{ConfigError, ExporterConfig, MatrixSpec};
use crate::prober::{ModuleOptions, ProberSet, SharedProber};

/// A matrix whose probe module, options and targets were validated at load.
#[derive(Clone)]
pub struct Matrix {
    /// Matrix name.
    pub name: String,
    /// Probe module for every target of the matrix.
    pub prober: SharedProber,
    /// Module options.
    pub options: ModuleOptions,
    /// Targets, in report order.
    pub targets: Vec<String>,
    /// Fixed per-target timeout, capped by the overall deadline.
    pub target_timeout: Option<Duration>,
}

impl Matrix {
    /// Resolve a matrix entry against the available probe modules.
    pub fn resolve(
        name: &str,
        spec: &MatrixSpec,
        probers: &ProberSet,
    ) -> Result<Self, ConfigError> {
        let prober = probers.get(&spec.prober).ok_or_else(|| {
            ConfigError::validation(format!(
                "matrix '{}': unknown prober '{}' (available: {})",
                name,
                spec.prober,
                probers.names().join(", ")
            ))
        })?;

        let options = prober
            .options(spec)
            .map_err(|e| ConfigError::validation(format!("matrix '{}': {}", name, e)))?;

        if spec.instances.is_empty() {
            return Err(ConfigError::validation(format!(
                "matrix '{}': instances must not be empty",
                name
            )));
        }

        for target in &spec.instances {
            prober.validate_target(target).map_err(|e| {
                ConfigError::validation(format!("matrix '{}': instance '{}': {}", name, target, e))
            })?;
        }

        Ok(Self {
            name: name.to_string(),
            prober,
            options,
            targets: spec.instances.clone(),
            target_timeout: spec.timeout_ms.map(Duration::from_millis),
        })
    }

    /// Name of the matrix's probe module.
    pub fn prober_name(&self) -> &str {
        self.prober.name()
    }
}

impl std::fmt::Debug for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix")
            .field("name", &self.name)
            .field("prober", &self.prober_name())
            .field("options", &self.options)
            .field("targets", &self.targets)
            .field("target_timeout", &self.target_timeout)
            .finish()
    }
}

/// Read-only set of matrixes, built once at startup.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    matrixes: BTreeMap<String, Matrix>,
}

/// Shareable registry handle.
pub type SharedRegistry = Arc<TargetRegistry>;

impl TargetRegistry {
    /// Resolve every matrix of the configuration, failing on the first invalid one.
    pub fn from_config(config: &ExporterConfig, probers: &ProberSet) -> Result<Self, ConfigError> {
        let mut matrixes = BTreeMap::new();

        for (name, spec) in &config.matrixes {
            let matrix = Matrix::resolve(name, spec, probers)?;
            debug!(
                matrix = %name,
                prober = %matrix.prober_name(),
                targets = matrix.targets.len(),
                "Matrix loaded"
            );
            matrixes.insert(name.clone(), matrix);
        }

        Ok(Self { matrixes })
    }

    /// Look up a matrix by name.
    pub fn lookup(&self, name: &str) -> Option<&Matrix> {
        self.matrixes.get(name)
    }

    /// Number of matrixes.
    pub fn len(&self) -> usize {
        self.matrixes.len()
    }

    /// Whether no matrix is configured.
    pub fn is_empty(&self) -> bool {
        self.matrixes.is_empty()
    }

    /// Matrix names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.matrixes.keys().map(String::as_str)
    }
}
