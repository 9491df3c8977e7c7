use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use tch::{
    nn::{self, ModuleT},
    vision::efficientnet,
    Tensor,
};

/// EfficientNet variants available from `tch::vision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backbone {
    B0,
    B1,
    B2,
    B3,
    B4,
    B5,
    B6,
    B7,
}

impl Backbone {
    const ALL: [Backbone; 8] = [
        Backbone::B0,
        Backbone::B1,
        Backbone::B2,
        Backbone::B3,
        Backbone::B4,
        Backbone::B5,
        Backbone::B6,
        Backbone::B7,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Backbone::B0 => "efficientnet-b0",
            Backbone::B1 => "efficientnet-b1",
            Backbone::B2 => "efficientnet-b2",
            Backbone::B3 => "efficientnet-b3",
            Backbone::B4 => "efficientnet-b4",
            Backbone::B5 => "efficientnet-b5",
            Backbone::B6 => "efficientnet-b6",
            Backbone::B7 => "efficientnet-b7",
        }
    }

    pub fn from_name(name: &str) -> Option<Backbone> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }

    /// Input resolution the variant was pretrained at.
    pub fn image_size(&self) -> u32 {
        match self {
            Backbone::B0 => 224,
            Backbone::B1 => 240,
            Backbone::B2 => 260,
            Backbone::B3 => 300,
            Backbone::B4 => 380,
            Backbone::B5 => 456,
            Backbone::B6 => 528,
            Backbone::B7 => 600,
        }
    }

    fn build(&self, p: &nn::Path, num_classes: i64) -> Box<dyn ModuleT> {
        match self {
            Backbone::B0 => Box::new(efficientnet::b0(p, num_classes)),
            Backbone::B1 => Box::new(efficientnet::b1(p, num_classes)),
            Backbone::B2 => Box::new(efficientnet::b2(p, num_classes)),
            Backbone::B3 => Box::new(efficientnet::b3(p, num_classes)),
            Backbone::B4 => Box::new(efficientnet::b4(p, num_classes)),
            Backbone::B5 => Box::new(efficientnet::b5(p, num_classes)),
            Backbone::B6 => Box::new(efficientnet::b6(p, num_classes)),
            Backbone::B7 => Box::new(efficientnet::b7(p, num_classes)),
        }
    }
}

/// Backbone with a classification head sized for the task.
#[derive(Debug)]
pub struct Classifier {
    net: Box<dyn ModuleT>,
}

impl Classifier {
    pub fn new(vs: &nn::Path, backbone: Backbone, num_classes: i64) -> Classifier {
        Classifier {
            net: backbone.build(vs, num_classes),
        }
    }
}

impl nn::ModuleT for Classifier {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }
}

#[derive(Debug, Default)]
pub struct PretrainedReport {
    pub copied: usize,
    /// Variables present in both stores whose shapes differ, i.e. the new head.
    pub reinitialized: Vec<String>,
    pub unused: usize,
}

/// Copies every pretrained tensor whose name and shape match a variable of `vs`.
///
/// The classification head of the pretrained file has 1000 outputs, so it never
/// matches and keeps its fresh initialization.
pub fn load_pretrained<T: AsRef<Path>>(vs: &nn::VarStore, path: T) -> Result<PretrainedReport> {
    let path = path.as_ref();
    let src = Tensor::load_multi(path)
        .with_context(|| format!("failed to read pretrained weights {}", path.display()))?;
    let mut dst = vs.variables();
    let mut report = PretrainedReport::default();
    for (name, tensor) in src.iter() {
        match dst.get_mut(name) {
            Some(var) if var.size() == tensor.size() => {
                tch::no_grad(|| var.copy_(tensor));
                report.copied += 1;
            }
            Some(_) => report.reinitialized.push(name.clone()),
            None => report.unused += 1,
        }
    }
    if report.copied == 0 {
        bail!("no tensors copied from {}", path.display());
    }
    debug!("head variables left as initialized: {:?}", report.reinitialized);
    info!(
        "loaded pretrained weights from {} (copied {}, reinitialized {}, unused {})",
        path.display(),
        report.copied,
        report.reinitialized.len(),
        report.unused
    );
    Ok(report)
}

/// Deep copy of every variable of a `VarStore`.
#[derive(Debug)]
pub struct WeightSnapshot {
    tensors: Vec<(String, Tensor)>,
}

impl WeightSnapshot {
    pub fn capture(vs: &nn::VarStore) -> WeightSnapshot {
        let mut tensors: Vec<(String, Tensor)> = tch::no_grad(|| {
            vs.variables()
                .into_iter()
                .map(|(name, var)| (name, var.detach().copy()))
                .collect()
        });
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        WeightSnapshot { tensors }
    }

    /// Writes the captured values back into the variables of `vs`.
    pub fn restore(&self, vs: &nn::VarStore) -> Result<()> {
        let mut vars = vs.variables();
        for (name, src) in self.tensors.iter() {
            let Some(dst) = vars.get_mut(name) else {
                bail!("variable {} missing from the var store", name);
            };
            tch::no_grad(|| dst.copy_(src));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{load_pretrained, Backbone, Classifier, WeightSnapshot};
    use tch::{
        nn::{self, Module, ModuleT},
        Device, Kind, Tensor,
    };

    #[test]
    fn test_backbone_names_round_trip() {
        for b in Backbone::ALL {
            assert_eq!(Backbone::from_name(b.name()), Some(b));
        }
        assert_eq!(Backbone::from_name("resnet-18"), None);
        assert_eq!(Backbone::B0.image_size(), 224);
        assert_eq!(Backbone::B7.image_size(), 600);
    }

    #[test]
    fn test_classifier_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = Classifier::new(&vs.root(), Backbone::B0, 4);
        let xs = Tensor::rand(&[2, 3, 64, 64], (Kind::Float, Device::Cpu));
        let ys = model.forward_t(&xs, false);
        assert_eq!(ys.size(), &[2, 4]);
    }

    #[test]
    fn test_snapshot_restore() {
        let vs = nn::VarStore::new(Device::Cpu);
        let linear = nn::linear(vs.root() / "fc", 3, 2, Default::default());
        let xs = Tensor::of_slice(&[0.5f32, -1.0, 2.0]).view([1, 3]);
        let before = linear.forward(&xs);

        let snapshot = WeightSnapshot::capture(&vs);
        tch::no_grad(|| {
            for (_, mut var) in vs.variables() {
                let _ = var.fill_(3.0);
            }
        });
        assert!(linear.forward(&xs) != before);

        snapshot.restore(&vs).unwrap();
        assert_eq!(linear.forward(&xs), before);
    }

    #[test]
    fn test_load_pretrained_skips_mismatched_head() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pretrained.ot");
        {
            let src = nn::VarStore::new(Device::Cpu);
            let _ = nn::linear(src.root() / "body", 3, 3, Default::default());
            let _ = nn::linear(src.root() / "head", 3, 10, Default::default());
            tch::no_grad(|| {
                for (_, mut var) in src.variables() {
                    let _ = var.fill_(1.0);
                }
            });
            src.save(&path)?;
        }

        let dst = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(dst.root() / "body", 3, 3, Default::default());
        let _ = nn::linear(dst.root() / "head", 3, 4, Default::default());
        let report = load_pretrained(&dst, &path)?;
        assert_eq!(report.copied, 2);
        assert_eq!(report.reinitialized.len(), 2);

        let vars = dst.variables();
        assert_eq!(vars["body.weight"], Tensor::ones(&[3, 3], (Kind::Float, Device::Cpu)));
        assert!(vars["head.bias"] != Tensor::ones(&[4], (Kind::Float, Device::Cpu)));
        Ok(())
    }
}
