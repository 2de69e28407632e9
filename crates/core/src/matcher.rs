//! Template matching with the `TM_CCOEFF_NORMED` score on RGB, with optional
//! binary masks taken from PNG alpha.
//!
//! `imageproc` computes the per-channel correlation and window sums over every
//! position. Its methods are not zero-mean and work on one channel, so the
//! three channels are combined into the mean-subtracted score here. The crate
//! accumulates in `f32`; the best few positions are rescored exactly before
//! one is returned.

use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, Rgb, RgbImage, RgbaImage};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{match_template, match_template_with_mask, MatchTemplateMethod};

const CHANNELS: usize = 3;
/// Positions taken from the approximate map for exact rescoring.
const RESCORE: usize = 16;
/// A window whose variance is this small relative to its energy is flat.
const FLAT_EXACT: f64 = 1e-9;
const FLAT_APPROX: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct Template {
    path: PathBuf,
    rgb: RgbImage,
    /// 1 where the pixel takes part in scoring, 0 where alpha was 0.
    mask: Option<GrayImage>,
}

impl Template {
    /// Read a PNG. Any decode or I/O problem yields `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let img = image::open(path).ok()?;
        let has_alpha = img.color().has_alpha();
        Some(Self::from_rgba(path, &img.to_rgba8(), has_alpha))
    }

    /// Build from pixels. With `use_alpha`, pixels with alpha 0 are ignored
    /// when scoring; a fully opaque image gets no mask at all.
    pub fn from_rgba(path: &Path, img: &RgbaImage, use_alpha: bool) -> Self {
        let rgb = RgbImage::from_fn(img.width(), img.height(), |x, y| {
            let p = img.get_pixel(x, y);
            Rgb([p[0], p[1], p[2]])
        });
        let mask = use_alpha
            .then(|| GrayImage::from_fn(img.width(), img.height(), |x, y| {
                Luma([u8::from(img.get_pixel(x, y)[3] > 0)])
            }))
            .filter(|m| m.pixels().any(|p| p[0] == 0));
        Self { path: path.to_path_buf(), rgb, mask }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name, used for ordering and logging.
    pub fn name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }
}

/// Load every `*.png` directly inside `dir`, ordered by file name.
/// Unreadable files are skipped; a missing folder is just empty.
pub fn load_dir(dir: &Path) -> Vec<Template> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| p.extension().map_or(false, |e| e.eq_ignore_ascii_case("png")))
        .collect();
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    paths.iter().filter_map(|p| Template::load(p)).collect()
}

fn plane(img: &RgbImage, c: usize) -> GrayImage {
    GrayImage::from_fn(img.width(), img.height(), |x, y| Luma([img.get_pixel(x, y)[c]]))
}

/// Zero-mean NCC from its summed parts. Correlation is undefined when either
/// side is flat; that counts as a match only when both are.
fn ccoeff(num: f64, var_t: f64, var_i: f64, energy: f64, flat: f64) -> f64 {
    let t_flat = var_t <= 1e-6;
    let i_flat = var_i <= flat * energy.max(1.0);
    match (t_flat, i_flat) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => (num / (var_t * var_i).sqrt()).clamp(-1.0, 1.0),
    }
}

/// Template prepared for one search.
struct Kernel<'a> {
    template: &'a Template,
    /// Per-channel template planes, masked pixels zeroed.
    planes: Vec<GrayImage>,
    /// Active pixels with their mean-subtracted RGB values.
    active: Vec<(u32, u32, [f64; CHANNELS])>,
    means: [f64; CHANNELS],
    var: f64,
}

impl<'a> Kernel<'a> {
    fn new(template: &'a Template) -> Option<Self> {
        let on = |x: u32, y: u32| template.mask.as_ref().map_or(true, |m| m.get_pixel(x, y)[0] > 0);
        let pixels: Vec<(u32, u32, [f64; CHANNELS])> = template
            .rgb
            .enumerate_pixels()
            .filter(|(x, y, _)| on(*x, *y))
            .map(|(x, y, p)| (x, y, [f64::from(p[0]), f64::from(p[1]), f64::from(p[2])]))
            .collect();
        if pixels.is_empty() {
            return None;
        }
        let n = pixels.len() as f64;
        let mut means = [0.0; CHANNELS];
        for (_, _, v) in &pixels {
            for c in 0..CHANNELS {
                means[c] += v[c] / n;
            }
        }
        let active: Vec<_> = pixels
            .into_iter()
            .map(|(x, y, v)| (x, y, [v[0] - means[0], v[1] - means[1], v[2] - means[2]]))
            .collect();
        let var = active.iter().flat_map(|a| a.2).map(|d| d * d).sum::<f64>();

        let planes = (0..CHANNELS)
            .map(|c| {
                GrayImage::from_fn(template.width(), template.height(), |x, y| {
                    Luma([if on(x, y) { template.rgb.get_pixel(x, y)[c] } else { 0 }])
                })
            })
            .collect();
        Some(Self { template, planes, active, means, var })
    }

    fn positions(&self, img: &RgbImage) -> Option<(u32, u32)> {
        let (w, h) = (self.template.width(), self.template.height());
        if img.width() < w || img.height() < h {
            return None;
        }
        Some((img.width() - w + 1, img.height() - h + 1))
    }

    /// Score of every position, from `imageproc` sums.
    fn score_map(&self, hay: &RgbImage, nx: u32, ny: u32) -> Vec<f64> {
        let (w, h) = (self.template.width(), self.template.height());
        let n = self.active.len() as f64;
        let len = (nx * ny) as usize;
        let mut num = vec![0.0; len];
        let mut var_i = vec![0.0; len];
        let mut energy = vec![0.0; len];

        for c in 0..CHANNELS {
            let hp = plane(hay, c);
            let mean = self.means[c];
            let mut add = |i: usize, cross: f64, s: f64, q: f64| {
                num[i] += cross - mean * s;
                var_i[i] += q - s * s / n;
                energy[i] += q;
            };
            match &self.template.mask {
                None => {
                    let cross = match_template(&hp, &self.planes[c], MatchTemplateMethod::CrossCorrelation);
                    let sums = integral_image::<_, u64>(&hp);
                    let squares = integral_squared_image::<_, u64>(&hp);
                    for y in 0..ny {
                        for x in 0..nx {
                            let i = (y * nx + x) as usize;
                            let s = window_sum(&sums, x, y, w, h);
                            let q = window_sum(&squares, x, y, w, h);
                            add(i, f64::from(cross.get_pixel(x, y)[0]), s, q);
                        }
                    }
                }
                Some(mask) => {
                    let zeros = GrayImage::new(w, h);
                    let cross = match_template_with_mask(&hp, &self.planes[c], MatchTemplateMethod::CrossCorrelation, mask);
                    let sums = match_template_with_mask(&hp, mask, MatchTemplateMethod::CrossCorrelation, mask);
                    let squares = match_template_with_mask(&hp, &zeros, MatchTemplateMethod::SumOfSquaredErrors, mask);
                    for y in 0..ny {
                        for x in 0..nx {
                            let i = (y * nx + x) as usize;
                            add(
                                i,
                                f64::from(cross.get_pixel(x, y)[0]),
                                f64::from(sums.get_pixel(x, y)[0]),
                                f64::from(squares.get_pixel(x, y)[0]),
                            );
                        }
                    }
                }
            }
        }

        let flat = if self.template.mask.is_some() { FLAT_APPROX } else { FLAT_EXACT };
        (0..len).map(|i| ccoeff(num[i], self.var, var_i[i], energy[i], flat)).collect()
    }

    /// Score at one position in `f64`, straight from the pixels.
    fn exact(&self, hay: &RgbImage, x0: u32, y0: u32) -> f64 {
        let n = self.active.len() as f64;
        let (mut num, mut var_i, mut energy) = (0.0, 0.0, 0.0);
        for c in 0..CHANNELS {
            let (mut s, mut q) = (0.0, 0.0);
            for &(dx, dy, t) in &self.active {
                let v = f64::from(hay.get_pixel(x0 + dx, y0 + dy)[c]);
                s += v;
                q += v * v;
                num += t[c] * v;
            }
            var_i += (q - s * s / n).max(0.0);
            energy += q;
        }
        ccoeff(num, self.var, var_i, energy, FLAT_EXACT)
    }
}

/// Sum over a `w`×`h` window of an `imageproc` integral image, which carries
/// a leading zero row and column.
fn window_sum(ii: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> f64 {
    let at = |x: u32, y: u32| ii.get_pixel(x, y)[0] as f64;
    at(x + w, y + h) + at(x, y) - at(x + w, y) - at(x, y + h)
}

/// Best `(x, y, score)` of `template` anywhere in `haystack`. Every position
/// is scored; ties go to the first in raster order.
pub fn best_match(haystack: &RgbImage, template: &Template) -> Option<(u32, u32, f64)> {
    let kernel = Kernel::new(template)?;
    let (nx, ny) = kernel.positions(haystack)?;
    let map = kernel.score_map(haystack, nx, ny);

    let mut top: Vec<(usize, f64)> = Vec::with_capacity(RESCORE + 1);
    for (i, &s) in map.iter().enumerate() {
        if top.len() < RESCORE || s > top[top.len() - 1].1 {
            let at = top.partition_point(|t| t.1 >= s);
            top.insert(at, (i, s));
            top.truncate(RESCORE);
        }
    }

    let mut best: Option<(u32, u32, f64)> = None;
    top.sort_by_key(|t| t.0);
    for (i, _) in top {
        let (x, y) = (i as u32 % nx, i as u32 / nx);
        let s = kernel.exact(haystack, x, y);
        if best.map_or(true, |b| s > b.2) {
            best = Some((x, y, s));
        }
    }
    best
}

/// Top-left corner of the best match if it scores at least `confidence`.
pub fn locate(haystack: &RgbImage, template: &Template, confidence: f64) -> Option<(u32, u32)> {
    best_match(haystack, template).filter(|m| m.2 >= confidence).map(|m| (m.0, m.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{imageops, Rgba};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(w: u32, h: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        RgbImage::from_fn(w, h, |_, _| Rgb(rng.gen()))
    }

    fn opaque(rgb: &RgbImage) -> RgbaImage {
        RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
            let p = rgb.get_pixel(x, y);
            Rgba([p[0], p[1], p[2], 255])
        })
    }

    fn template_from(img: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> Template {
        let crop = imageops::crop_imm(img, x, y, w, h).to_image();
        Template::from_rgba(Path::new("t.png"), &opaque(&crop), true)
    }

    fn cross(size: u32, bg: Rgb<u8>, fg: Rgb<u8>) -> RgbImage {
        let mid = size / 2;
        RgbImage::from_fn(size, size, |x, y| if x == mid || y == mid { fg } else { bg })
    }

    #[test]
    fn test_finds_exact_crop() {
        let hay = noise(120, 90, 1);
        let t = template_from(&hay, 37, 21, 12, 10);
        assert!(!t.is_masked());
        let (x, y, s) = best_match(&hay, &t).unwrap();
        assert_eq!((x, y), (37, 21));
        assert!(s > 0.999);
        assert_eq!(locate(&hay, &t, 0.9), Some((37, 21)));
    }

    #[test]
    fn test_fine_detail_on_flat_background() {
        let board = RgbImage::from_fn(32, 32, |x, y| {
            if (x + y) % 2 == 0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
        });
        let mut hay = RgbImage::from_pixel(200, 150, Rgb([255, 255, 255]));
        imageops::replace(&mut hay, &board, 120, 90);
        let t = Template::from_rgba(Path::new("board.png"), &opaque(&board), true);

        let (x, y, s) = best_match(&hay, &t).unwrap();
        assert_eq!((x, y), (120, 90));
        assert!(s > 0.999, "{s}");
        assert_eq!(locate(&hay, &t, 0.8), Some((120, 90)));
    }

    #[test]
    fn test_colour_tells_apart_equal_brightness() {
        let black = Rgb([0, 0, 0]);
        let (red, green) = (Rgb([255, 0, 0]), Rgb([0, 76, 0]));
        assert_eq!(
            imageops::grayscale(&RgbImage::from_pixel(1, 1, red)).get_pixel(0, 0),
            imageops::grayscale(&RgbImage::from_pixel(1, 1, green)).get_pixel(0, 0),
        );
        let t = Template::from_rgba(Path::new("red.png"), &opaque(&cross(11, black, red)), true);

        let mut screen = RgbImage::from_pixel(60, 60, black);
        imageops::replace(&mut screen, &cross(11, black, green), 20, 20);
        assert_eq!(locate(&screen, &t, 0.95), None);

        imageops::replace(&mut screen, &cross(11, black, red), 20, 20);
        assert_eq!(locate(&screen, &t, 0.95), Some((20, 20)));
    }

    #[test]
    fn test_below_threshold_is_none() {
        let hay = noise(80, 80, 2);
        let t = template_from(&noise(80, 80, 3), 0, 0, 14, 14);
        assert_eq!(locate(&hay, &t, 0.8), None);
    }

    #[test]
    fn test_template_larger_than_haystack() {
        let hay = noise(10, 10, 4);
        let t = template_from(&noise(20, 20, 5), 0, 0, 20, 20);
        assert!(best_match(&hay, &t).is_none());
    }

    #[test]
    fn test_mask_ignores_transparent_pixels() {
        let hay = noise(100, 80, 6);
        let (ox, oy) = (40u32, 30u32);
        // Inner 6x6 matches the haystack; a transparent garbage frame around it.
        let rgba = RgbaImage::from_fn(14, 14, |x, y| {
            if (4..10).contains(&x) && (4..10).contains(&y) {
                let p = hay.get_pixel(ox + x, oy + y);
                Rgba([p[0], p[1], p[2], 255])
            } else {
                Rgba([255, 0, 0, 0])
            }
        });
        let t = Template::from_rgba(Path::new("masked.png"), &rgba, true);
        assert!(t.is_masked());
        assert_eq!(locate(&hay, &t, 0.95), Some((ox, oy)));
    }

    #[test]
    fn test_flat_template_matches_only_flat_windows() {
        let mut hay = noise(40, 40, 7);
        imageops::replace(&mut hay, &RgbImage::from_pixel(8, 8, Rgb([9, 9, 9])), 30, 2);
        let t = Template::from_rgba(Path::new("flat.png"), &opaque(&RgbImage::from_pixel(8, 8, Rgb([200, 10, 10]))), true);
        assert_eq!(locate(&hay, &t, 0.99), Some((30, 2)));
    }

    #[test]
    fn test_load_dir_orders_by_name_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        img.save(dir.path().join("b.png")).unwrap();
        img.save(dir.path().join("a.PNG")).unwrap();
        std::fs::write(dir.path().join("c.png"), b"not a png").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let names: Vec<String> = load_dir(dir.path()).iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["a.PNG", "b.png"]);
        assert!(load_dir(&dir.path().join("missing")).is_empty());
    }
}
