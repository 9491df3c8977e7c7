//! Accuracy-per-epoch chart rendered straight to a PNG.

use std::path::Path;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use log::{info, warn};

const CHART_WIDTH: u32 = 800;
const CHART_HEIGHT: u32 = 500;
const MARGIN_TOP: f64 = 30.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_BOTTOM: f64 = 50.0;
const MARGIN_LEFT: f64 = 60.0;

const COLOR_BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const COLOR_GRID: Rgb<u8> = Rgb([236, 240, 241]);
const COLOR_AXIS: Rgb<u8> = Rgb([0, 0, 0]);
pub const COLOR_TRAIN: Rgb<u8> = Rgb([0, 0, 255]);
pub const COLOR_VALIDATION: Rgb<u8> = Rgb([255, 0, 0]);

const LINE_WIDTH: i64 = 2;
const MARKER_RADIUS: i64 = 6;
const TICK_LENGTH: i64 = 5;
const GLYPH_SCALE: i64 = 2;

/// 5x7 bitmaps for the axis captions, one row per byte, high bit on the left.
const GLYPHS: [(char, [u8; 7]); 6] = [
    ('a', [0x00, 0x00, 0x0e, 0x01, 0x0f, 0x11, 0x0f]),
    ('c', [0x00, 0x00, 0x0e, 0x10, 0x10, 0x11, 0x0e]),
    ('e', [0x00, 0x00, 0x0e, 0x11, 0x1f, 0x10, 0x0e]),
    ('h', [0x10, 0x10, 0x16, 0x19, 0x11, 0x11, 0x11]),
    ('o', [0x00, 0x00, 0x0e, 0x11, 0x11, 0x11, 0x0e]),
    ('p', [0x00, 0x00, 0x1e, 0x11, 0x1e, 0x10, 0x10]),
];
const X_CAPTION: &str = "epoch";
const Y_CAPTION: &str = "acc";

/// Train curve in blue, validation curve in red, best validation epoch as a
/// red dot.
#[derive(Debug)]
pub struct AccuracyPlot<'a> {
    pub train_acc: &'a [f64],
    pub val_acc: &'a [f64],
    pub best_epoch: Option<usize>,
}

impl<'a> AccuracyPlot<'a> {
    fn epochs(&self) -> usize {
        self.train_acc.len().max(self.val_acc.len())
    }

    fn y_max(&self) -> f64 {
        self.train_acc
            .iter()
            .chain(self.val_acc.iter())
            .fold(100.0, |acc: f64, v| acc.max(*v))
    }

    /// Pixel position of `(epoch, accuracy)`.
    pub fn project(&self, epoch: usize, accuracy: f64) -> (i64, i64) {
        let plot_w = CHART_WIDTH as f64 - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_h = CHART_HEIGHT as f64 - MARGIN_TOP - MARGIN_BOTTOM;
        let span = (self.epochs().max(2) - 1) as f64;
        let x = MARGIN_LEFT + epoch as f64 / span * plot_w;
        let y = MARGIN_TOP + plot_h - accuracy.max(0.0) / self.y_max() * plot_h;
        (x.round() as i64, y.round() as i64)
    }

    pub fn render(&self) -> RgbImage {
        let mut canvas = Canvas::new(CHART_WIDTH, CHART_HEIGHT);
        let (x0, y0) = self.project(0, 0.0);
        let (x1, _) = self.project(self.epochs().max(2) - 1, 0.0);

        for i in 0..=5 {
            let (_, y) = self.project(0, self.y_max() * i as f64 / 5.0);
            canvas.line((x0, y), (x1, y), 1, COLOR_GRID);
            canvas.line((x0 - TICK_LENGTH, y), (x0, y), 1, COLOR_AXIS);
        }
        for epoch in 0..self.epochs() {
            let (x, _) = self.project(epoch, 0.0);
            canvas.line((x, y0), (x, y0 + TICK_LENGTH), 1, COLOR_AXIS);
        }
        let (_, y_top) = self.project(0, self.y_max());
        canvas.line((x0, y0), (x1, y0), 1, COLOR_AXIS);
        canvas.line((x0, y0), (x0, y_top), 1, COLOR_AXIS);

        let caption_x = (x0 + x1 - Canvas::text_width(X_CAPTION)) / 2;
        canvas.text((caption_x, y0 + 20), X_CAPTION, COLOR_AXIS);
        canvas.text((8, (y0 + y_top) / 2 - 7), Y_CAPTION, COLOR_AXIS);

        self.curve(&mut canvas, self.train_acc, COLOR_TRAIN);
        self.curve(&mut canvas, self.val_acc, COLOR_VALIDATION);

        if let Some((epoch, acc)) = self
            .best_epoch
            .and_then(|e| self.val_acc.get(e).map(|acc| (e, *acc)))
        {
            canvas.disc(self.project(epoch, acc), MARKER_RADIUS, COLOR_VALIDATION);
        }
        canvas.image
    }

    fn curve(&self, canvas: &mut Canvas, values: &[f64], color: Rgb<u8>) {
        let points: Vec<(i64, i64)> = values
            .iter()
            .enumerate()
            .map(|(epoch, acc)| self.project(epoch, *acc))
            .collect();
        match points.as_slice() {
            [single] => canvas.disc(*single, LINE_WIDTH, color),
            _ => points
                .windows(2)
                .for_each(|w| canvas.line(w[0], w[1], LINE_WIDTH, color)),
        }
    }

    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.render()
            .save(path)
            .with_context(|| format!("failed to save plot to {}", path.display()))?;
        Ok(())
    }
}

/// Opens a saved chart in the system image viewer. Returns `false` when no
/// viewer could be started, e.g. on a headless machine.
pub fn show<T: AsRef<Path>>(path: T) -> bool {
    let path = path.as_ref();
    if !path.is_file() {
        warn!("cannot display {}: no such file", path.display());
        return false;
    }
    match opener::open(path) {
        Ok(()) => {
            info!("opened {}", path.display());
            true
        }
        Err(e) => {
            warn!("cannot display {}: {}", path.display(), e);
            false
        }
    }
}

struct Canvas {
    image: RgbImage,
}

impl Canvas {
    fn new(width: u32, height: u32) -> Canvas {
        Canvas {
            image: RgbImage::from_pixel(width, height, COLOR_BACKGROUND),
        }
    }

    fn put(&mut self, x: i64, y: i64, color: Rgb<u8>) {
        let (w, h) = self.image.dimensions();
        if x >= 0 && y >= 0 && (x as u32) < w && (y as u32) < h {
            self.image.put_pixel(x as u32, y as u32, color);
        }
    }

    fn line(&mut self, from: (i64, i64), to: (i64, i64), width: i64, color: Rgb<u8>) {
        let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).max(1);
        let half = width / 2;
        for s in 0..=steps {
            let t = s as f64 / steps as f64;
            let x = from.0 + ((to.0 - from.0) as f64 * t).round() as i64;
            let y = from.1 + ((to.1 - from.1) as f64 * t).round() as i64;
            for dx in -half..width - half {
                for dy in -half..width - half {
                    self.put(x + dx, y + dy, color);
                }
            }
        }
    }

    fn text_width(text: &str) -> i64 {
        let n = text.chars().count() as i64;
        (n * 6 - 1).max(0) * GLYPH_SCALE
    }

    /// Draws `text` with its top-left corner at `origin`; characters without a
    /// glyph leave a gap.
    fn text(&mut self, origin: (i64, i64), text: &str, color: Rgb<u8>) {
        for (i, ch) in text.chars().enumerate() {
            let Some((_, rows)) = GLYPHS.iter().find(|(c, _)| *c == ch) else {
                continue;
            };
            let left = origin.0 + i as i64 * 6 * GLYPH_SCALE;
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..5 {
                    if bits & (0x10 >> col) == 0 {
                        continue;
                    }
                    for dy in 0..GLYPH_SCALE {
                        for dx in 0..GLYPH_SCALE {
                            self.put(
                                left + col * GLYPH_SCALE + dx,
                                origin.1 + row as i64 * GLYPH_SCALE + dy,
                                color,
                            );
                        }
                    }
                }
            }
        }
    }

    fn disc(&mut self, center: (i64, i64), radius: i64, color: Rgb<u8>) {
        for dx in -radius..=radius {
            for dy in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put(center.0 + dx, center.1 + dy, color);
                }
            }
        }
    }
}
