use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::dilate;
use log::debug;
use ndarray::{Array3, Array4};
use rand::Rng;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::config::{BackgroundKind, Config};
use crate::frame::Frame;

/// Binary image, 255 where motion was found.
pub type ForegroundMask = GrayImage;

const MOG2_MODES: usize = 3;
const MOG2_VAR_INIT: f32 = 15.;
const MOG2_VAR_MIN: f32 = 4.;
const MOG2_VAR_MAX: f32 = 75.;
/// squared Mahalanobis distance for a sample to update an existing mode
const MOG2_VAR_THRESHOLD_GEN: f32 = 9.;
/// cumulative weight of the modes that describe the background
const MOG2_BACKGROUND_RATIO: f32 = 0.9;

const KNN_SAMPLES: usize = 7;
/// number of close samples needed to call a pixel background
const KNN_MATCHES: usize = 2;

/// Isolates moving pixels of a stream.
///
/// Either an adaptive per-pixel background model, which produces a mask from
/// the very first frame, or a difference against the previous frame, which
/// returns an empty mask on the first frame.
pub struct BackgroundMotionIsolator {
    model: BackgroundModel,
    threshold: u8,
    dilate_iterations: u8,
}

enum BackgroundModel {
    Mog2(Mog2Model),
    Knn(KnnModel),
    Diff(FrameDifference),
}

impl BackgroundMotionIsolator {
    pub fn new(config: &Config) -> Self {
        let model = match config.background {
            BackgroundKind::Mog2 => {
                BackgroundModel::Mog2(Mog2Model::new(config.bg_history, config.mog2_var_threshold))
            }
            BackgroundKind::Knn => BackgroundModel::Knn(KnnModel::new(
                config.bg_history,
                config.knn_dist2_threshold,
                config.seed,
            )),
            BackgroundKind::Diff => BackgroundModel::Diff(FrameDifference::new(config.blur_sigma)),
        };
        Self {
            model,
            threshold: config.diff_threshold,
            dilate_iterations: config.dilate_iterations,
        }
    }

    pub fn isolate(&mut self, frame: &Frame) -> ForegroundMask {
        let raw = match &mut self.model {
            BackgroundModel::Mog2(model) => model.apply(&frame.image),
            BackgroundModel::Knn(model) => model.apply(&frame.image),
            BackgroundModel::Diff(model) => match model.apply(&frame.image) {
                Some(diff) => diff,
                None => return GrayImage::new(frame.width(), frame.height()),
            },
        };
        let binary = binarize(&raw, self.threshold);
        if self.dilate_iterations == 0 {
            binary
        } else {
            // k iterations of a 3x3 square kernel
            dilate(&binary, Norm::LInf, self.dilate_iterations)
        }
    }
}

fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = image.clone();
    for p in out.pixels_mut() {
        p[0] = if p[0] > threshold { 255 } else { 0 };
    }
    out
}

/// Number of foreground pixels in a mask
pub fn foreground_count(mask: &ForegroundMask) -> usize {
    mask.pixels().filter(|p| p[0] > 0).count()
}

// ----------------------------------------------------------------------------
// frame differencing
// ----------------------------------------------------------------------------

struct FrameDifference {
    blur_sigma: f32,
    previous: Option<GrayImage>,
}

impl FrameDifference {
    fn new(blur_sigma: f32) -> Self {
        Self {
            blur_sigma,
            previous: None,
        }
    }

    fn apply(&mut self, image: &RgbImage) -> Option<GrayImage> {
        let gray = gaussian_blur_f32(&imageops::grayscale(image), self.blur_sigma);
        let diff = match &self.previous {
            Some(previous) if previous.dimensions() == gray.dimensions() => {
                let mut diff = GrayImage::new(gray.width(), gray.height());
                for ((d, a), b) in diff.pixels_mut().zip(previous.pixels()).zip(gray.pixels()) {
                    *d = Luma([a[0].abs_diff(b[0])]);
                }
                Some(diff)
            }
            _ => None,
        };
        self.previous = Some(gray);
        diff
    }
}

// ----------------------------------------------------------------------------
// mixture of gaussians
// ----------------------------------------------------------------------------

/// Per-pixel adaptive gaussian mixture over RGB values.
/// ref Zivkovic, "Improved adaptive Gaussian mixture model for background subtraction"
struct Mog2Model {
    history: usize,
    var_threshold: f32,
    frame_count: usize,
    /// (height, width, mode)
    weights: Array3<f32>,
    variances: Array3<f32>,
    /// (height, width, mode, channel)
    means: Array4<f32>,
    /// (height, width, 1) number of active modes
    mode_counts: Array3<u8>,
}

impl Mog2Model {
    fn new(history: usize, var_threshold: f32) -> Self {
        Self {
            history,
            var_threshold,
            frame_count: 0,
            weights: Array3::zeros((0, 0, MOG2_MODES)),
            variances: Array3::zeros((0, 0, MOG2_MODES)),
            means: Array4::zeros((0, 0, MOG2_MODES, 3)),
            mode_counts: Array3::zeros((0, 0, 1)),
        }
    }

    fn reset(&mut self, width: usize, height: usize) {
        debug!("mog2 model reset to {width}x{height}");
        self.frame_count = 0;
        self.weights = Array3::zeros((height, width, MOG2_MODES));
        self.variances = Array3::zeros((height, width, MOG2_MODES));
        self.means = Array4::zeros((height, width, MOG2_MODES, 3));
        self.mode_counts = Array3::zeros((height, width, 1));
    }

    fn apply(&mut self, image: &RgbImage) -> GrayImage {
        let (w, h) = (image.width() as usize, image.height() as usize);
        if self.weights.dim() != (h, w, MOG2_MODES) {
            self.reset(w, h);
        }
        self.frame_count += 1;
        let alpha = 1. / self.frame_count.min(self.history) as f32;

        let mut mask = GrayImage::new(w as u32, h as u32);
        for (x, y, pixel) in image.enumerate_pixels() {
            let sample = [pixel[0] as f32, pixel[1] as f32, pixel[2] as f32];
            let foreground = self.update_pixel(y as usize, x as usize, sample, alpha);
            if foreground {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        mask
    }

    /// Update the modes of one pixel, returns true when the sample is foreground.
    fn update_pixel(&mut self, y: usize, x: usize, sample: [f32; 3], alpha: f32) -> bool {
        let modes = self.mode_counts[[y, x, 0]] as usize;

        let mut matched = None;
        let mut background = false;
        let mut cumulative = 0.;
        for k in 0..modes {
            let var = self.variances[[y, x, k]];
            let d2: f32 = (0..3)
                .map(|c| (sample[c] - self.means[[y, x, k, c]]).powi(2))
                .sum();
            if d2 < MOG2_VAR_THRESHOLD_GEN * var {
                if cumulative < MOG2_BACKGROUND_RATIO && d2 < self.var_threshold * var {
                    background = true;
                }
                matched = Some((k, d2));
                break;
            }
            cumulative += self.weights[[y, x, k]];
        }

        for k in 0..modes {
            self.weights[[y, x, k]] *= 1. - alpha;
        }

        let updated = match matched {
            Some((k, d2)) => {
                self.weights[[y, x, k]] += alpha;
                let rho = alpha / self.weights[[y, x, k]];
                for c in 0..3 {
                    let mean = self.means[[y, x, k, c]];
                    self.means[[y, x, k, c]] = mean + rho * (sample[c] - mean);
                }
                let var = self.variances[[y, x, k]];
                self.variances[[y, x, k]] =
                    (var + rho * (d2 - var)).clamp(MOG2_VAR_MIN, MOG2_VAR_MAX);
                k
            }
            None => {
                // replace the weakest mode once all are in use
                let k = modes.min(MOG2_MODES - 1);
                if modes < MOG2_MODES {
                    self.mode_counts[[y, x, 0]] += 1;
                }
                self.weights[[y, x, k]] = alpha;
                for c in 0..3 {
                    self.means[[y, x, k, c]] = sample[c];
                }
                self.variances[[y, x, k]] = MOG2_VAR_INIT;
                k
            }
        };

        let modes = self.mode_counts[[y, x, 0]] as usize;
        let total: f32 = (0..modes).map(|k| self.weights[[y, x, k]]).sum();
        if total > 0. {
            for k in 0..modes {
                self.weights[[y, x, k]] /= total;
            }
        }

        // keep modes sorted by weight, only the updated one can be out of place
        let mut k = updated;
        while k > 0 && self.weights[[y, x, k]] > self.weights[[y, x, k - 1]] {
            self.swap_modes(y, x, k, k - 1);
            k -= 1;
        }

        !background
    }

    fn swap_modes(&mut self, y: usize, x: usize, a: usize, b: usize) {
        self.weights.swap([y, x, a], [y, x, b]);
        self.variances.swap([y, x, a], [y, x, b]);
        for c in 0..3 {
            self.means.swap([y, x, a, c], [y, x, b, c]);
        }
    }
}

// ----------------------------------------------------------------------------
// nearest neighbours
// ----------------------------------------------------------------------------

/// Per-pixel history of recent RGB samples. A pixel is background when enough
/// stored samples lie within `dist2_threshold` of the current value.
struct KnnModel {
    history: usize,
    dist2_threshold: f32,
    rng: Xoshiro256PlusPlus,
    /// (height, width, sample slot, channel)
    samples: Array4<u8>,
    /// (height, width, 1) number of filled sample slots
    filled: Array3<u8>,
}

impl KnnModel {
    fn new(history: usize, dist2_threshold: f32, seed: u64) -> Self {
        Self {
            history,
            dist2_threshold,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            samples: Array4::zeros((0, 0, KNN_SAMPLES, 3)),
            filled: Array3::zeros((0, 0, 1)),
        }
    }

    fn apply(&mut self, image: &RgbImage) -> GrayImage {
        let (w, h) = (image.width() as usize, image.height() as usize);
        if self.filled.dim() != (h, w, 1) {
            debug!("knn model reset to {w}x{h}");
            self.samples = Array4::zeros((h, w, KNN_SAMPLES, 3));
            self.filled = Array3::zeros((h, w, 1));
        }
        // chance for a sample to enter a full history so that it spans `history` frames
        let replace_probability = (KNN_SAMPLES as f64 / self.history as f64).min(1.);

        let mut mask = GrayImage::new(w as u32, h as u32);
        for (x, y, pixel) in image.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let filled = self.filled[[y, x, 0]] as usize;
            let mut matches = 0;
            for s in 0..filled {
                let d2: f32 = (0..3)
                    .map(|c| (pixel[c] as f32 - self.samples[[y, x, s, c]] as f32).powi(2))
                    .sum();
                if d2 < self.dist2_threshold {
                    matches += 1;
                    if matches >= KNN_MATCHES {
                        break;
                    }
                }
            }
            if matches < KNN_MATCHES {
                mask.put_pixel(x as u32, y as u32, Luma([255]));
            }

            let slot = if filled < KNN_SAMPLES {
                self.filled[[y, x, 0]] += 1;
                Some(filled)
            } else if self.rng.gen_bool(replace_probability) {
                Some(self.rng.gen_range(0..KNN_SAMPLES))
            } else {
                None
            };
            if let Some(slot) = slot {
                for c in 0..3 {
                    self.samples[[y, x, slot, c]] = pixel[c];
                }
            }
        }
        mask
    }
}
