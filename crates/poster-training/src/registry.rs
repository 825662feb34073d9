//! Name-to-constructor registries.
//!
//! Config files refer to losses, optimisers, schedulers and models by string
//! key (short names like `adamw`, or the dotted names older configs used such
//! as `torch.optim.AdamW`). Every key is resolved against an explicit table
//! here; unknown keys fail at startup with the list of known ones.

use crate::config::{Config, Kwargs, MonitorMode};
use crate::error::{TrainingError, TrainingResult};
use crate::losses::{BceWithLogits, FocalLoss, LossFn, SoftMarginLoss};
use crate::models::ModelSettings;
use crate::optim::OptimizerSettings;
use crate::scheduler::SchedulerSettings;
use std::collections::BTreeMap;

pub type Constructor<T> = fn(&Kwargs) -> TrainingResult<T>;

pub struct Registry<T> {
    kind: &'static str,
    entries: BTreeMap<&'static str, Constructor<T>>,
    aliases: BTreeMap<&'static str, &'static str>,
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("keys", &self.keys())
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl<T> Registry<T> {
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self { kind, entries: BTreeMap::new(), aliases: BTreeMap::new() }
    }

    pub fn register(&mut self, key: &'static str, constructor: Constructor<T>) -> &mut Self {
        self.entries.insert(key, constructor);
        self
    }

    /// Make `alias` resolve to the already registered `key`.
    pub fn alias(&mut self, alias: &'static str, key: &'static str) -> &mut Self {
        debug_assert!(self.entries.contains_key(key), "alias target `{key}` is not registered");
        self.aliases.insert(alias, key);
        self
    }

    #[must_use]
    pub fn keys(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.canonical(key).is_ok()
    }

    /// The registered key `key` refers to, following aliases.
    pub fn canonical(&self, key: &str) -> TrainingResult<&'static str> {
        if let Some((k, _)) = self.entries.get_key_value(key) {
            return Ok(k);
        }
        if let Some(target) = self.aliases.get(key) {
            return Ok(target);
        }
        Err(TrainingError::UnresolvedReference {
            kind: self.kind,
            key: key.to_string(),
            known: self.keys().join(", "),
        })
    }

    pub fn build(&self, key: &str, kwargs: &Kwargs) -> TrainingResult<T> {
        let canonical = self.canonical(key)?;
        let constructor = self.entries[canonical];
        constructor(kwargs).map_err(|e| match e {
            TrainingError::InvalidConfig(msg) => {
                TrainingError::InvalidConfig(format!("{} `{key}`: {msg}", self.kind))
            }
            other => other,
        })
    }
}

/// All registries the pipeline resolves config keys against.
#[derive(Debug)]
pub struct Registries {
    pub losses: Registry<Box<dyn LossFn>>,
    pub optimizers: Registry<OptimizerSettings>,
    pub schedulers: Registry<SchedulerSettings>,
    pub models: Registry<ModelSettings>,
}

impl Default for Registries {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registries {
    #[must_use]
    pub fn builtin() -> Self {
        let mut losses: Registry<Box<dyn LossFn>> = Registry::new("loss");
        losses
            .register("bce", |kw| Ok(Box::new(BceWithLogits::from_kwargs(kw)?)))
            .register("soft_margin", |kw| Ok(Box::new(SoftMarginLoss::from_kwargs(kw)?)))
            .register("focal", |kw| Ok(Box::new(FocalLoss::from_kwargs(kw)?)))
            .alias("bce_with_logits", "bce")
            .alias("torch.nn.BCEWithLogitsLoss", "bce")
            .alias("torch.nn.MultiLabelSoftMarginLoss", "soft_margin")
            .alias("torchvision.ops.sigmoid_focal_loss", "focal");

        let mut optimizers: Registry<OptimizerSettings> = Registry::new("optimizer");
        optimizers
            .register("sgd", OptimizerSettings::sgd_from_kwargs)
            .register("adam", |kw| OptimizerSettings::adam_from_kwargs(kw, false))
            .register("adamw", |kw| OptimizerSettings::adam_from_kwargs(kw, true))
            .alias("torch.optim.SGD", "sgd")
            .alias("torch.optim.Adam", "adam")
            .alias("torch.optim.AdamW", "adamw");

        let mut schedulers: Registry<SchedulerSettings> = Registry::new("scheduler");
        schedulers
            .register("constant", SchedulerSettings::constant_from_kwargs)
            .register("step", SchedulerSettings::step_from_kwargs)
            .register("cosine", SchedulerSettings::cosine_from_kwargs)
            .register("exponential", SchedulerSettings::exponential_from_kwargs)
            .register("reduce_on_plateau", SchedulerSettings::plateau_from_kwargs)
            .alias("torch.optim.lr_scheduler.ConstantLR", "constant")
            .alias("torch.optim.lr_scheduler.StepLR", "step")
            .alias("torch.optim.lr_scheduler.CosineAnnealingLR", "cosine")
            .alias("torch.optim.lr_scheduler.ExponentialLR", "exponential")
            .alias("torch.optim.lr_scheduler.ReduceLROnPlateau", "reduce_on_plateau");

        let mut models: Registry<ModelSettings> = Registry::new("model");
        models.register("linear", ModelSettings::linear_from_kwargs);

        Self { losses, optimizers, schedulers, models }
    }

    /// Resolve and construct everything `config` names, without keeping the results.
    pub fn validate(&self, config: &Config) -> TrainingResult<()> {
        for loss in &config.losses {
            self.losses.build(&loss.loss_fn, &loss.loss_kwargs)?;
        }
        self.optimizers.build(&config.optimizer, &config.optimizer_kwargs)?;
        self.schedulers.build(&config.scheduler, &config.scheduler_kwargs)?;
        self.models.build(config.model_name()?, &config.model_kwargs)?;
        Ok(())
    }
}

/// Fail on keys a constructor does not understand.
pub(crate) fn reject_unknown(kwargs: &Kwargs, allowed: &[&str]) -> TrainingResult<()> {
    if let Some(key) = kwargs.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(TrainingError::InvalidConfig(format!(
            "unexpected argument `{key}` (accepted: {})",
            allowed.join(", ")
        )));
    }
    Ok(())
}

/// First present key among `names`, as a float.
pub(crate) fn kwarg_f64(kwargs: &Kwargs, names: &[&str], default: f64) -> TrainingResult<f64> {
    match names.iter().find_map(|n| kwargs.get(*n)) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| TrainingError::InvalidConfig(format!("`{}` must be a number, got {value}", names[0]))),
    }
}

pub(crate) fn kwarg_usize(kwargs: &Kwargs, names: &[&str], default: usize) -> TrainingResult<usize> {
    match names.iter().find_map(|n| kwargs.get(*n)) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| {
                TrainingError::InvalidConfig(format!("`{}` must be a non-negative integer, got {value}", names[0]))
            }),
    }
}

pub(crate) fn kwarg_mode(kwargs: &Kwargs, default: MonitorMode) -> TrainingResult<MonitorMode> {
    match kwargs.get("mode") {
        None => Ok(default),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|_| TrainingError::InvalidConfig(format!("`mode` must be `min` or `max`, got {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use serde_json::json;

    fn kwargs(value: serde_json::Value) -> Kwargs {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_aliases_resolve_to_canonical_keys() {
        let registries = Registries::builtin();
        assert_eq!(registries.optimizers.canonical("torch.optim.AdamW").unwrap(), "adamw");
        assert_eq!(registries.losses.canonical("bce").unwrap(), "bce");
        assert!(registries.schedulers.contains("torch.optim.lr_scheduler.CosineAnnealingLR"));
    }

    #[test]
    fn test_unknown_key_names_the_reference() {
        let registries = Registries::builtin();
        let err = registries.optimizers.build("torch.optim.Lion", &Kwargs::new()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("optimizer"));
        assert!(msg.contains("torch.optim.Lion"));
        assert!(msg.contains("adamw"));
    }

    #[test]
    fn test_unexpected_kwarg_is_rejected() {
        let registries = Registries::builtin();
        let err = registries.optimizers.build("sgd", &kwargs(json!({"lr": 0.1, "nesterov_typo": true}))).unwrap_err();
        assert!(err.to_string().contains("nesterov_typo"));
    }

    #[test]
    fn test_validate_sample_config() {
        let registries = Registries::builtin();
        registries.validate(&sample_config()).unwrap();
    }

    #[test]
    fn test_validate_flags_unknown_model() {
        let registries = Registries::builtin();
        let mut config = sample_config();
        config.model_kwargs.insert("model_name".into(), json!("resnet18"));
        let err = registries.validate(&config).unwrap_err();
        assert!(matches!(err, TrainingError::UnresolvedReference { kind: "model", .. }));
    }

    #[test]
    fn test_kwarg_helpers() {
        let kw = kwargs(json!({"T_max": 5, "gamma": 0.5, "mode": "min"}));
        assert_eq!(kwarg_usize(&kw, &["t_max", "T_max"], 1).unwrap(), 5);
        assert!((kwarg_f64(&kw, &["gamma"], 0.1).unwrap() - 0.5).abs() < 1e-12);
        assert!((kwarg_f64(&kw, &["missing"], 0.1).unwrap() - 0.1).abs() < 1e-12);
        assert_eq!(kwarg_mode(&kw, MonitorMode::Max).unwrap(), MonitorMode::Min);
        assert!(kwarg_usize(&kwargs(json!({"n": -1})), &["n"], 0).is_err());
    }
}
