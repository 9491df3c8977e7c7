//! Best-model persistence.
//!
//! Two files are written per run:
//! * the full checkpoint, every variable plus a [`ModelCard`] stored as a
//!   UTF-8 byte tensor under [`MODEL_CARD_KEY`], enough to rebuild the model;
//! * the weights-only checkpoint, a plain `VarStore::save`.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Tensor};

use crate::model::{Backbone, Classifier};

pub const MODEL_CARD_KEY: &str = "__model_card__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub backbone: String,
    pub num_classes: i64,
    pub image_size: u32,
    pub class_names: Vec<String>,
    pub run_name: String,
    pub best_epoch: Option<usize>,
    pub best_accuracy: f64,
}

impl ModelCard {
    fn to_tensor(&self) -> Result<Tensor> {
        let json = serde_json::to_vec(self)?;
        Ok(Tensor::of_slice(&json))
    }

    fn from_tensor(tensor: &Tensor) -> Result<ModelCard> {
        let bytes: Vec<u8> = tensor.iter::<i64>()?.map(|b| b as u8).collect();
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn save_full<T: AsRef<Path>>(vs: &nn::VarStore, card: &ModelCard, path: T) -> Result<()> {
    let path = path.as_ref();
    let mut named: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named.push((MODEL_CARD_KEY.to_string(), card.to_tensor()?));
    Tensor::save_multi(named.as_slice(), path)
        .with_context(|| format!("failed to save model to {}", path.display()))?;
    Ok(())
}

pub fn save_weights<T: AsRef<Path>>(vs: &nn::VarStore, path: T) -> Result<()> {
    let path = path.as_ref();
    vs.save(path)
        .with_context(|| format!("failed to save weights to {}", path.display()))?;
    Ok(())
}

/// Writes both checkpoints, creating their directory if needed.
pub fn save_best<T: AsRef<Path>>(
    vs: &nn::VarStore,
    card: &ModelCard,
    full_path: T,
    weights_path: T,
) -> Result<()> {
    for path in [full_path.as_ref(), weights_path.as_ref()] {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
    }
    save_full(vs, card, &full_path)?;
    save_weights(vs, &weights_path)?;
    info!("model saved");
    Ok(())
}

pub struct LoadedModel {
    pub card: ModelCard,
    pub vs: nn::VarStore,
    pub model: Classifier,
}

/// Rebuilds the classifier described by a full checkpoint and loads its weights.
pub fn load_full<T: AsRef<Path>>(path: T, device: Device) -> Result<LoadedModel> {
    let path = path.as_ref();
    let mut named = Tensor::load_multi(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let card_idx = named
        .iter()
        .position(|(name, _)| name == MODEL_CARD_KEY)
        .ok_or_else(|| anyhow!("{} has no model card", path.display()))?;
    let (_, card_tensor) = named.swap_remove(card_idx);
    let card = ModelCard::from_tensor(&card_tensor)?;
    let backbone = Backbone::from_name(&card.backbone)
        .ok_or_else(|| anyhow!("unknown backbone {}", card.backbone))?;

    let vs = nn::VarStore::new(device);
    let model = Classifier::new(&vs.root(), backbone, card.num_classes);
    let mut vars = vs.variables();
    for (name, tensor) in named.iter() {
        let mut var = vars
            .remove(name)
            .ok_or_else(|| anyhow!("unexpected variable {} in {}", name, path.display()))?;
        tch::no_grad(|| var.copy_(tensor));
    }
    if !vars.is_empty() {
        let mut missing: Vec<&String> = vars.keys().collect();
        missing.sort();
        bail!("{} is missing variables {:?}", path.display(), missing);
    }
    Ok(LoadedModel { card, vs, model })
}

#[cfg(test)]
mod tests {
    use super::{load_full, save_best, save_full, ModelCard, MODEL_CARD_KEY};
    use crate::model::{Backbone, Classifier};
    use tch::{
        nn::{self, ModuleT},
        Device, Kind, Tensor,
    };

    fn card() -> ModelCard {
        ModelCard {
            backbone: Backbone::B0.name().to_string(),
            num_classes: 4,
            image_size: 32,
            class_names: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            run_name: "unit".into(),
            best_epoch: Some(2),
            best_accuracy: 75.0,
        }
    }

    #[test]
    fn test_save_and_reload_best_model() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let full = dir.path().join("weights/aram_unit.pt");
        let weights = dir.path().join("weights/president_aram_unit.pt");

        let vs = nn::VarStore::new(Device::Cpu);
        let model = Classifier::new(&vs.root(), Backbone::B0, 4);
        save_best(&vs, &card(), &full, &weights)?;
        assert!(full.exists());
        assert!(weights.exists());

        let loaded = load_full(&full, Device::Cpu)?;
        assert_eq!(loaded.card, card());
        let xs = Tensor::rand(&[1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let expected = model.forward_t(&xs, false);
        let actual = loaded.model.forward_t(&xs, false);
        assert!(expected.allclose(&actual, 1e-5, 1e-6, false));

        let mut weights_only = nn::VarStore::new(Device::Cpu);
        let _ = Classifier::new(&weights_only.root(), Backbone::B0, 4);
        weights_only.load(&weights)?;
        Ok(())
    }

    #[test]
    fn test_missing_card_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("plain.pt");
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(vs.root(), 2, 2, Default::default());
        vs.save(&path)?;
        assert!(load_full(&path, Device::Cpu).is_err());
        Ok(())
    }

    #[test]
    fn test_checkpoint_with_missing_variable_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let full = dir.path().join("full.pt");
        let truncated = dir.path().join("truncated.pt");

        let vs = nn::VarStore::new(Device::Cpu);
        let _ = Classifier::new(&vs.root(), Backbone::B0, 4);
        save_full(&vs, &card(), &full)?;

        let mut named = Tensor::load_multi(&full)?;
        let idx = named
            .iter()
            .position(|(name, _)| name != MODEL_CARD_KEY)
            .unwrap();
        let (dropped, _) = named.remove(idx);
        Tensor::save_multi(named.as_slice(), &truncated)?;

        let err = load_full(&truncated, Device::Cpu).err().unwrap();
        assert!(err.to_string().contains(&dropped));
        Ok(())
    }
}
