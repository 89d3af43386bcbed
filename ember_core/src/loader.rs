//! Engine options loader

use crate::error::{EngineError, Result};
use crate::options::EngineOptions;
use std::path::Path;

/// Loads engine options from YAML or JSON documents
pub struct OptionsLoader {
    /// Options used for keys a document does not mention
    base: EngineOptions,
}

impl OptionsLoader {
    /// Create a new loader
    pub fn new() -> Self {
        Self {
            base: EngineOptions::default(),
        }
    }

    /// Create a loader that layers documents over `base`
    pub fn with_base(base: EngineOptions) -> Self {
        Self { base }
    }

    /// Load options from a file, choosing the format by extension
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<EngineOptions> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => self.load_json(&content),
            _ => self.load_string(&content),
        }
    }

    /// Load options from a YAML string
    pub fn load_string(&self, content: &str) -> Result<EngineOptions> {
        let overrides: serde_yaml::Value = serde_yaml::from_str(content)?;
        let options = match overrides {
            serde_yaml::Value::Null => self.base.clone(),
            overrides => self.merge(overrides)?,
        };
        self.validate(&options)?;
        Ok(options)
    }

    /// Load options from a JSON string
    pub fn load_json(&self, content: &str) -> Result<EngineOptions> {
        let overrides: serde_json::Value = serde_json::from_str(content)?;
        let overrides: serde_yaml::Value = serde_json::from_value(overrides)?;
        let options = self.merge(overrides)?;
        self.validate(&options)?;
        Ok(options)
    }

    /// Apply the keys of a document on top of the base options
    fn merge(&self, overrides: serde_yaml::Value) -> Result<EngineOptions> {
        let serde_yaml::Value::Mapping(overrides) = overrides else {
            return Err(EngineError::InvalidOption {
                name: "<root>".to_string(),
                message: "expected a mapping of option names to values".to_string(),
            });
        };
        let mut merged = match serde_yaml::to_value(&self.base)? {
            serde_yaml::Value::Mapping(map) => map,
            _ => serde_yaml::Mapping::new(),
        };
        for (key, value) in overrides {
            merged.insert(key, value);
        }
        Ok(serde_yaml::from_value(serde_yaml::Value::Mapping(merged))?)
    }

    /// Validate loaded options
    pub fn validate(&self, options: &EngineOptions) -> Result<()> {
        fn invalid(name: &str, message: impl Into<String>) -> EngineError {
            EngineError::InvalidOption {
                name: name.to_string(),
                message: message.into(),
            }
        }

        if options.compilation_threshold == 0 {
            return Err(invalid("compilation-threshold", "must be positive"));
        }
        if options.min_invoke_threshold == 0 {
            return Err(invalid("min-invoke-threshold", "must be positive"));
        }
        if options.compiler_threads == 0 {
            return Err(invalid("compiler-threads", "at least one thread is required"));
        }
        if !options.inlining_min_frequency.is_finite() || options.inlining_min_frequency < 0.0 {
            return Err(invalid(
                "inlining-min-frequency",
                format!("expected a non-negative number, got {}", options.inlining_min_frequency),
            ));
        }
        if options.inlining_max_callee_size > options.inlining_max_caller_size {
            return Err(invalid(
                "inlining-max-callee-size",
                format!(
                    "{} exceeds inlining-max-caller-size {}",
                    options.inlining_max_callee_size, options.inlining_max_caller_size
                ),
            ));
        }
        if options.max_recursive_inlining_depth == 0 {
            return Err(invalid("max-recursive-inlining-depth", "must be at least 1"));
        }
        if options.splitting_start_call_count == 0 {
            return Err(invalid("splitting-start-call-count", "must be positive"));
        }

        if options.min_invoke_threshold > options.compilation_threshold {
            tracing::warn!(
                "min-invoke-threshold {} exceeds compilation-threshold {}; calls alone decide eligibility",
                options.min_invoke_threshold,
                options.compilation_threshold
            );
        }

        Ok(())
    }
}

impl Default for OptionsLoader {
    fn default() -> Self {
        Self::new()
    }
}
