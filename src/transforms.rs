//! Image augmentation and tensor conversion.
//!
//! A [`Compose`] pipeline runs its geometric steps on a `DynamicImage`, then
//! converts to a `[3, H, W]` float tensor and normalizes each channel.

use image::{imageops, DynamicImage, Rgb, RgbImage};
use rand::Rng;
use tch::Tensor;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Resize { width: u32, height: u32 },
    RandomHorizontalFlip { p: f64 },
    RandomVerticalFlip { p: f64 },
    /// Fixed quarter turn, counter-clockwise.
    Rotate90,
    /// Rotation by an angle drawn uniformly from `[-degrees, degrees]`.
    RandomRotation { degrees: f64 },
    /// Rotation, x-shear and isotropic scale, each drawn uniformly from its range.
    RandomAffine {
        degrees: f64,
        shear: f64,
        scale: (f64, f64),
    },
}

impl Transform {
    pub fn apply<R: Rng + ?Sized>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        match *self {
            Transform::Resize { width, height } => {
                img.resize_exact(width, height, imageops::FilterType::Triangle)
            }
            Transform::RandomHorizontalFlip { p } => {
                if rng.gen_bool(p) {
                    img.fliph()
                } else {
                    img
                }
            }
            Transform::RandomVerticalFlip { p } => {
                if rng.gen_bool(p) {
                    img.flipv()
                } else {
                    img
                }
            }
            Transform::Rotate90 => img.rotate270(),
            Transform::RandomRotation { degrees } => {
                let angle = uniform(rng, -degrees, degrees);
                warp(&img.to_rgb8(), &Affine::new(angle, 0.0, 1.0)).into()
            }
            Transform::RandomAffine {
                degrees,
                shear,
                scale,
            } => {
                let angle = uniform(rng, -degrees, degrees);
                let shear = uniform(rng, -shear, shear);
                let scale = uniform(rng, scale.0, scale.1);
                warp(&img.to_rgb8(), &Affine::new(angle, shear, scale)).into()
            }
        }
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    if high > low {
        rng.gen_range(low..high)
    } else {
        low
    }
}

/// 2x2 linear part of a centered affine map (rotation, x-shear, scale).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    m: [[f64; 2]; 2],
}

impl Affine {
    /// Angles are in degrees.
    pub fn new(angle: f64, shear: f64, scale: f64) -> Affine {
        let rot = angle.to_radians();
        let sx = shear.to_radians();
        let a = rot.cos();
        let b = -rot.cos() * sx.tan() - rot.sin();
        let c = rot.sin();
        let d = -rot.sin() * sx.tan() + rot.cos();
        Affine {
            m: [[a * scale, b * scale], [c * scale, d * scale]],
        }
    }

    fn inverse(&self) -> Option<[[f64; 2]; 2]> {
        let [[a, b], [c, d]] = self.m;
        let det = a * d - b * c;
        if det.abs() < f64::EPSILON {
            return None;
        }
        Some([[d / det, -b / det], [-c / det, a / det]])
    }
}

/// Applies `affine` around the image center with nearest-neighbour sampling.
/// Output keeps the input size; pixels mapped from outside the source are black.
pub fn warp(src: &RgbImage, affine: &Affine) -> RgbImage {
    let (w, h) = src.dimensions();
    let Some([[ia, ib], [ic, id]]) = affine.inverse() else {
        return RgbImage::new(w, h);
    };
    let cx = (w as f64 - 1.0) * 0.5;
    let cy = (h as f64 - 1.0) * 0.5;
    RgbImage::from_fn(w, h, |x, y| {
        let dx = x as f64 - cx;
        let dy = y as f64 - cy;
        let sx = (ia * dx + ib * dy + cx).round();
        let sy = (ic * dx + id * dy + cy).round();
        if sx < 0.0 || sy < 0.0 || sx >= w as f64 || sy >= h as f64 {
            Rgb([0, 0, 0])
        } else {
            *src.get_pixel(sx as u32, sy as u32)
        }
    })
}

/// Converts to a `[3, H, W]` float tensor with values in `[0, 1]`.
pub fn to_tensor(img: &DynamicImage) -> Tensor {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let plane = (w * h) as usize;
    let mut data = vec![0f32; 3 * plane];
    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }
    Tensor::of_slice(&data).view([3, h as i64, w as i64])
}

pub fn normalize(tensor: &Tensor, mean: &[f32; 3], std: &[f32; 3]) -> Tensor {
    let mean = Tensor::of_slice(mean).view([3, 1, 1]);
    let std = Tensor::of_slice(std).view([3, 1, 1]);
    (tensor - mean) / std
}

#[derive(Debug, Clone)]
pub struct Compose {
    steps: Vec<Transform>,
    mean: [f32; 3],
    std: [f32; 3],
}

impl Compose {
    pub fn new(steps: Vec<Transform>) -> Compose {
        Compose {
            steps,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// Augmenting pipeline. The fixed quarter turn and the random rotation
    /// jitter compound.
    pub fn train(size: u32) -> Compose {
        Compose::new(vec![
            Transform::Resize {
                width: size,
                height: size,
            },
            Transform::RandomHorizontalFlip { p: 0.5 },
            Transform::RandomVerticalFlip { p: 0.5 },
            Transform::Rotate90,
            Transform::RandomRotation { degrees: 10.0 },
            Transform::RandomAffine {
                degrees: 0.0,
                shear: 10.0,
                scale: (0.8, 1.2),
            },
        ])
    }

    pub fn validation(size: u32) -> Compose {
        Compose::new(vec![Transform::Resize {
            width: size,
            height: size,
        }])
    }

    pub fn apply_image<R: Rng + ?Sized>(&self, img: DynamicImage, rng: &mut R) -> DynamicImage {
        self.steps
            .iter()
            .fold(img, |img, step| step.apply(img, rng))
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: DynamicImage, rng: &mut R) -> Tensor {
        let img = self.apply_image(img, rng);
        normalize(&to_tensor(&img), &self.mean, &self.std)
    }
}
