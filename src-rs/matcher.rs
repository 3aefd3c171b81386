//! Template matching and colour probes on screen captures. Used for toolbar
//! icons and other affordances with no stable accessible identity.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::LayoutConfig;
use crate::error::{AutomationError, Result};
use crate::surface::{Point, Pointer, Rect, ScreenCapture};

pub const ADVANCED_SCALES: [f32; 5] = [0.8, 0.9, 1.0, 1.1, 1.2];
pub const ADVANCED_CONFIDENCE: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Affordance {
    Catalog,
    PostingWindow,
    SelectDocuments,
    Associate,
    Yes,
    Close,
    New,
    AccountField,
    UpdateProducts,
    UpdateClients,
    UpdateSuppliers,
}

impl Affordance {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Catalog => "catalogo.png",
            Self::PostingWindow => "contabilizador.png",
            Self::SelectDocuments => "seleccionar_CFDI.png",
            Self::Associate => "asociar.png",
            Self::Yes => "si.png",
            Self::Close => "cerrar.png",
            Self::New => "nuevo.png",
            Self::AccountField => "cuenta.png",
            Self::UpdateProducts => "actualizarproductos.png",
            Self::UpdateClients => "actualizarCliente.png",
            Self::UpdateSuppliers => "actualizarProveedor.png",
        }
    }
}

/// Decoded grayscale templates, looked up under the configured directory and
/// then `img/` and `../img/`.
pub struct TemplateLibrary {
    dirs: Vec<PathBuf>,
    cache: RefCell<HashMap<Affordance, Rc<GrayImage>>>,
}

impl TemplateLibrary {
    pub fn new(dir: Option<PathBuf>) -> Self {
        let mut dirs: Vec<PathBuf> = dir.into_iter().collect();
        dirs.push(PathBuf::from("img"));
        dirs.push(PathBuf::from("../img"));
        Self {
            dirs,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn insert(&self, affordance: Affordance, template: GrayImage) {
        self.cache.borrow_mut().insert(affordance, Rc::new(template));
    }

    pub fn get(&self, affordance: Affordance) -> Result<Rc<GrayImage>> {
        if let Some(template) = self.cache.borrow().get(&affordance) {
            return Ok(template.clone());
        }
        let path = self
            .dirs
            .iter()
            .map(|dir| dir.join(affordance.file_name()))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                AutomationError::Template(format!(
                    "{} not found in {:?}",
                    affordance.file_name(),
                    self.dirs
                ))
            })?;
        let template = Rc::new(image::open(&path)?.to_luma8());
        log::debug!("[matcher] loaded template {}", path.display());
        self.cache.borrow_mut().insert(affordance, template.clone());
        Ok(template)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Preprocess {
    Identity,
    Equalized,
    Blurred,
    Edges,
}

impl Preprocess {
    pub const ALL: [Preprocess; 4] = [Self::Identity, Self::Equalized, Self::Blurred, Self::Edges];

    pub fn apply(self, img: &GrayImage) -> GrayImage {
        match self {
            Self::Identity => img.clone(),
            Self::Equalized => equalize_histogram(img),
            Self::Blurred => gaussian_blur_3x3(img),
            Self::Edges => canny(img, 100.0, 200.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    pub score: f32,
    pub top_left: Point,
    pub width: u32,
    pub height: u32,
    pub scale: f32,
    pub preprocess: Preprocess,
}

impl MatchResult {
    pub fn center(&self) -> Point {
        Point::new(
            self.top_left.x + (self.width / 2) as i32,
            self.top_left.y + (self.height / 2) as i32,
        )
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_origin(self.top_left, self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    pub confidence: f32,
    pub double_click: bool,
    pub scale_range: (f32, f32),
    pub steps: u32,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            confidence: 0.8,
            double_click: false,
            scale_range: (0.8, 1.2),
            steps: 10,
        }
    }
}

impl MatchOptions {
    pub fn from_layout(layout: &LayoutConfig) -> Self {
        Self {
            confidence: layout.confidence,
            double_click: false,
            scale_range: (layout.scale_range[0], layout.scale_range[1]),
            steps: layout.scale_steps,
        }
    }

    pub fn double(mut self) -> Self {
        self.double_click = true;
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn scales(&self) -> Vec<f32> {
        linspace(self.scale_range.0, self.scale_range.1, self.steps)
    }
}

pub fn linspace(start: f32, end: f32, steps: u32) -> Vec<f32> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        n => (0..n)
            .map(|i| start + (end - start) * i as f32 / (n - 1) as f32)
            .collect(),
    }
}

fn scaled(template: &GrayImage, scale: f32) -> Option<GrayImage> {
    let (w, h) = template.dimensions();
    let sw = (w as f32 * scale).round() as u32;
    let sh = (h as f32 * scale).round() as u32;
    if sw == 0 || sh == 0 {
        return None;
    }
    if (sw, sh) == (w, h) {
        return Some(template.clone());
    }
    Some(imageops::resize(template, sw, sh, FilterType::Triangle))
}

/// Searches at or below this many pixel products run exhaustively.
const EXHAUSTIVE_BUDGET: u64 = 1 << 24;
/// Coarse positions refined at full resolution.
const COARSE_CANDIDATES: usize = 16;
/// Smallest template side kept when shrinking for the coarse pass.
const MIN_COARSE_SIDE: u32 = 6;

/// Summed-area tables of an image, so the mean and variance under any window
/// come out in constant time.
struct Integral {
    width: usize,
    pixels: Vec<f64>,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let pixels: Vec<f64> = image.pixels().map(|p| f64::from(p[0])).collect();
        let stride = w + 1;
        let mut sum = vec![0.0f64; stride * (h + 1)];
        let mut sq = vec![0.0f64; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = pixels[y * w + x];
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }
        Self {
            width: w,
            pixels,
            sum,
            sq,
        }
    }

    fn area(table: &[f64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> f64 {
        let (x1, y1) = (x + w, y + h);
        table[y1 * stride + x1] - table[y * stride + x1] - table[y1 * stride + x]
            + table[y * stride + x]
    }
}

/// Mean-subtracted template laid over an [`Integral`].
struct Correlator<'a> {
    image: &'a Integral,
    centered: Vec<f64>,
    norm: f64,
    tw: usize,
    th: usize,
}

impl<'a> Correlator<'a> {
    fn new(image: &'a Integral, template: &GrayImage) -> Self {
        let values: Vec<f64> = template.pixels().map(|p| f64::from(p[0])).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let centered: Vec<f64> = values.iter().map(|v| v - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum();
        Self {
            image,
            centered,
            norm,
            tw: template.width() as usize,
            th: template.height() as usize,
        }
    }

    /// NCC with the template's top-left corner at `(x, y)`; 0 over flat areas.
    fn score_at(&self, x: usize, y: usize) -> f32 {
        let img = self.image;
        let stride = img.width + 1;
        let n = (self.tw * self.th) as f64;
        let s = Integral::area(&img.sum, stride, x, y, self.tw, self.th);
        let variance = Integral::area(&img.sq, stride, x, y, self.tw, self.th) - s * s / n;
        let denom = (self.norm * variance.max(0.0)).sqrt();
        if self.norm < 1e-9 || variance < 1e-6 || denom < 1e-9 {
            return 0.0;
        }
        let mut numerator = 0.0;
        for ty in 0..self.th {
            let row = &img.pixels[(y + ty) * img.width + x..][..self.tw];
            let trow = &self.centered[ty * self.tw..][..self.tw];
            numerator += row.iter().zip(trow).map(|(a, b)| a * b).sum::<f64>();
        }
        (numerator / denom).clamp(-1.0, 1.0) as f32
    }

    /// Best position in the inclusive window, first one wins ties.
    fn best_in(&self, xs: (usize, usize), ys: (usize, usize)) -> Option<(f32, u32, u32)> {
        let mut best: Option<(f32, u32, u32)> = None;
        for y in ys.0..=ys.1 {
            for x in xs.0..=xs.1 {
                let score = self.score_at(x, y);
                if best.map_or(true, |(b, _, _)| score > b) {
                    best = Some((score, x as u32, y as u32));
                }
            }
        }
        best
    }

    /// Highest scoring positions at least `spacing` apart.
    fn peaks(
        &self,
        max_x: usize,
        max_y: usize,
        count: usize,
        spacing: usize,
    ) -> Vec<(usize, usize)> {
        let mut scored: Vec<(f32, usize, usize)> =
            Vec::with_capacity((max_x + 1) * (max_y + 1));
        for y in 0..=max_y {
            for x in 0..=max_x {
                scored.push((self.score_at(x, y), x, y));
            }
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut picked: Vec<(usize, usize)> = Vec::with_capacity(count);
        for (_, x, y) in scored {
            if picked.len() == count {
                break;
            }
            let clear = picked
                .iter()
                .all(|&(px, py)| px.abs_diff(x).max(py.abs_diff(y)) >= spacing);
            if clear {
                picked.push((x, y));
            }
        }
        picked
    }
}

/// Power-of-two shrink factor (at most 4) keeping both template sides at
/// least [`MIN_COARSE_SIDE`].
fn pyramid_factor(tw: u32, th: u32) -> u32 {
    let mut factor = 1;
    while factor < 4
        && tw / (factor * 2) >= MIN_COARSE_SIDE
        && th / (factor * 2) >= MIN_COARSE_SIDE
    {
        factor *= 2;
    }
    factor
}

fn shrink(image: &GrayImage, factor: u32) -> GrayImage {
    let w = (image.width() / factor).max(1);
    let h = (image.height() / factor).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

/// Normalized cross-correlation (mean-subtracted) of `template` over `image`.
/// Returns the best score and its top-left corner.
///
/// Large searches run coarse to fine: both images are shrunk, the strongest
/// coarse peaks are kept, and only their neighbourhoods are scored at full
/// resolution.
pub fn match_template(image: &GrayImage, template: &GrayImage) -> Option<(f32, u32, u32)> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }
    let (max_x, max_y) = ((iw - tw) as usize, (ih - th) as usize);
    let table = Integral::new(image);
    let full = Correlator::new(&table, template);

    let factor = pyramid_factor(tw, th);
    let work = ((max_x + 1) * (max_y + 1)) as u64 * u64::from(tw * th);
    if factor == 1 || work <= EXHAUSTIVE_BUDGET {
        return full.best_in((0, max_x), (0, max_y));
    }

    let small_image = shrink(image, factor);
    let small_template = shrink(template, factor);
    let (sw, sh) = small_image.dimensions();
    let (stw, sth) = small_template.dimensions();
    if stw > sw || sth > sh {
        return full.best_in((0, max_x), (0, max_y));
    }
    let small_table = Integral::new(&small_image);
    let coarse = Correlator::new(&small_table, &small_template);
    let spacing = (stw.min(sth) / 2).max(1) as usize;
    let (coarse_x, coarse_y) = ((sw - stw) as usize, (sh - sth) as usize);
    let peaks = coarse.peaks(coarse_x, coarse_y, COARSE_CANDIDATES, spacing);

    let (rx, ry) = (f64::from(iw) / f64::from(sw), f64::from(ih) / f64::from(sh));
    let radius = factor as usize + 1;
    let mut best: Option<(f32, u32, u32)> = None;
    for (cx, cy) in peaks {
        let x = (cx as f64 * rx).round() as usize;
        let y = (cy as f64 * ry).round() as usize;
        let xs = (x.saturating_sub(radius).min(max_x), (x + radius).min(max_x));
        let ys = (y.saturating_sub(radius).min(max_y), (y + radius).min(max_y));
        if let Some(found) = full.best_in(xs, ys) {
            if best.map_or(true, |(b, _, _)| found.0 > b) {
                best = Some(found);
            }
        }
    }
    best
}

/// Best match of `template` over `scales` of one preprocessing variant.
pub fn best_match(
    screen: &GrayImage,
    template: &GrayImage,
    scales: &[f32],
    preprocess: Preprocess,
) -> Option<MatchResult> {
    let mut best: Option<MatchResult> = None;
    for &scale in scales {
        let Some(resized) = scaled(template, scale) else {
            continue;
        };
        let Some((score, x, y)) = match_template(screen, &resized) else {
            continue;
        };
        if best.map_or(true, |b| score > b.score) {
            best = Some(MatchResult {
                score,
                top_left: Point::new(x as i32, y as i32),
                width: resized.width(),
                height: resized.height(),
                scale,
                preprocess,
            });
        }
    }
    best
}

/// Every preprocessing variant times [`ADVANCED_SCALES`], keeping the global best.
pub fn best_match_advanced(screen: &GrayImage, template: &GrayImage) -> Option<MatchResult> {
    let mut best: Option<MatchResult> = None;
    for preprocess in Preprocess::ALL {
        let screen = preprocess.apply(screen);
        let template = preprocess.apply(template);
        if let Some(found) = best_match(&screen, &template, &ADVANCED_SCALES, preprocess) {
            if best.map_or(true, |b| found.score > b.score) {
                best = Some(found);
            }
        }
    }
    best
}

pub fn equalize_histogram(img: &GrayImage) -> GrayImage {
    let mut hist = [0u64; 256];
    for p in img.pixels() {
        hist[p[0] as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    let mut cdf = [0u64; 256];
    let mut running = 0;
    for (i, count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }
    let cdf_min = cdf.iter().copied().find(|v| *v > 0).unwrap_or(0);
    if total == cdf_min {
        return img.clone();
    }
    let range = (total - cdf_min) as f64;
    let lut: Vec<u8> = cdf
        .iter()
        .map(|v| ((v.saturating_sub(cdf_min)) as f64 / range * 255.0).round() as u8)
        .collect();
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        Luma([lut[img.get_pixel(x, y)[0] as usize]])
    })
}

fn at(img: &GrayImage, x: i64, y: i64) -> f32 {
    let cx = x.clamp(0, img.width() as i64 - 1) as u32;
    let cy = y.clamp(0, img.height() as i64 - 1) as u32;
    f32::from(img.get_pixel(cx, cy)[0])
}

/// 3x3 Gaussian with the `[1 2 1] / 4` kernel in both directions.
pub fn gaussian_blur_3x3(img: &GrayImage) -> GrayImage {
    const K: [f32; 3] = [0.25, 0.5, 0.25];
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let mut acc = 0.0;
        for (dy, ky) in (-1..=1).zip(K) {
            for (dx, kx) in (-1..=1).zip(K) {
                acc += at(img, x as i64 + dx, y as i64 + dy) * kx * ky;
            }
        }
        Luma([acc.round().clamp(0.0, 255.0) as u8])
    })
}

/// Canny edge map: Sobel gradients (L1 magnitude), non-maximum suppression and
/// hysteresis between `low` and `high`. Edges are 255, the rest 0.
pub fn canny(img: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut magnitude = vec![0.0f32; w * h];
    let mut gx_map = vec![0.0f32; w * h];
    let mut gy_map = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (x as i64, y as i64);
            let gx = at(img, xi + 1, yi - 1) + 2.0 * at(img, xi + 1, yi) + at(img, xi + 1, yi + 1)
                - at(img, xi - 1, yi - 1)
                - 2.0 * at(img, xi - 1, yi)
                - at(img, xi - 1, yi + 1);
            let gy = at(img, xi - 1, yi + 1) + 2.0 * at(img, xi, yi + 1) + at(img, xi + 1, yi + 1)
                - at(img, xi - 1, yi - 1)
                - 2.0 * at(img, xi, yi - 1)
                - at(img, xi + 1, yi - 1);
            let i = y * w + x;
            gx_map[i] = gx;
            gy_map[i] = gy;
            magnitude[i] = gx.abs() + gy.abs();
        }
    }

    let mag = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            0.0
        } else {
            magnitude[y as usize * w + x as usize]
        }
    };

    // 0 = none, 1 = weak, 2 = strong
    let mut class = vec![0u8; w * h];
    let mut stack = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let m = magnitude[i];
            if m <= low {
                continue;
            }
            let angle = gy_map[i].atan2(gx_map[i]).to_degrees().rem_euclid(180.0);
            let (dx, dy) = if !(22.5..157.5).contains(&angle) {
                (1, 0)
            } else if angle < 67.5 {
                (1, 1)
            } else if angle < 112.5 {
                (0, 1)
            } else {
                (-1, 1)
            };
            let (xi, yi) = (x as i64, y as i64);
            if m < mag(xi + dx, yi + dy) || m < mag(xi - dx, yi - dy) {
                continue;
            }
            if m > high {
                class[i] = 2;
                stack.push(i);
            } else {
                class[i] = 1;
            }
        }
    }

    while let Some(i) = stack.pop() {
        let (x, y) = ((i % w) as i64, (i / w) as i64);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if class[j] == 1 {
                    class[j] = 2;
                    stack.push(j);
                }
            }
        }
    }

    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        Luma([if class[y as usize * w + x as usize] == 2 { 255 } else { 0 }])
    })
}

pub fn color_matches(pixel: &Rgb<u8>, target: &Rgb<u8>, tolerance: u8) -> bool {
    pixel
        .0
        .iter()
        .zip(target.0.iter())
        .all(|(a, b)| a.abs_diff(*b) <= tolerance)
}

pub struct ScreenMatcher<'a> {
    screen: &'a dyn ScreenCapture,
    pointer: &'a dyn Pointer,
    clock: &'a dyn Clock,
    templates: &'a TemplateLibrary,
}

impl<'a> ScreenMatcher<'a> {
    pub fn new(
        screen: &'a dyn ScreenCapture,
        pointer: &'a dyn Pointer,
        clock: &'a dyn Clock,
        templates: &'a TemplateLibrary,
    ) -> Self {
        Self {
            screen,
            pointer,
            clock,
            templates,
        }
    }

    fn grayscale_screen(&self) -> Result<GrayImage> {
        let capture: RgbImage = self.screen.capture()?;
        Ok(imageops::grayscale(&capture))
    }

    pub fn locate(
        &self,
        affordance: Affordance,
        options: &MatchOptions,
    ) -> Result<Option<MatchResult>> {
        let template = self.templates.get(affordance)?;
        let screen = self.grayscale_screen()?;
        Ok(best_match(&screen, &template, &options.scales(), Preprocess::Identity))
    }

    /// Clicks the centre of the best match across scales when its score reaches
    /// `options.confidence`.
    pub fn find_and_click_image(&self, affordance: Affordance, options: &MatchOptions) -> bool {
        let found = match self.locate(affordance, options) {
            Ok(found) => found,
            Err(err) => {
                log::error!("[matcher] {affordance:?}: {err}");
                return false;
            }
        };
        match found {
            Some(found) if found.score >= options.confidence => {
                let target = found.center();
                if let Err(err) = self.pointer.click_at(target, options.double_click) {
                    log::error!("[matcher] click on {affordance:?} failed: {err}");
                    return false;
                }
                log::info!(
                    "[matcher] {affordance:?} clicked at ({}, {}) with confidence {:.2}",
                    target.x,
                    target.y,
                    found.score
                );
                true
            }
            Some(found) => {
                log::warn!(
                    "[matcher] {affordance:?} not found; best confidence {:.2}",
                    found.score
                );
                false
            }
            None => {
                log::warn!("[matcher] {affordance:?} not found at any scale");
                false
            }
        }
    }

    pub fn find_and_click_image_advanced(
        &self,
        affordance: Affordance,
        confidence: f32,
        double_click: bool,
    ) -> (bool, Option<Point>) {
        let found = self.templates.get(affordance).and_then(|template| {
            let screen = self.grayscale_screen()?;
            Ok(best_match_advanced(&screen, &template))
        });
        match found {
            Ok(Some(found)) if found.score >= confidence => {
                let target = found.center();
                if let Err(err) = self.pointer.click_at(target, double_click) {
                    log::error!("[matcher] click on {affordance:?} failed: {err}");
                    return (false, None);
                }
                log::info!(
                    "[matcher] {affordance:?} found ({:?}, scale {:.1}) with confidence {:.2}",
                    found.preprocess,
                    found.scale,
                    found.score
                );
                (true, Some(target))
            }
            Ok(best) => {
                log::warn!(
                    "[matcher] {affordance:?} not found; best confidence {:.2}",
                    best.map_or(0.0, |b| b.score)
                );
                (false, None)
            }
            Err(err) => {
                log::error!("[matcher] advanced search for {affordance:?} failed: {err}");
                (false, None)
            }
        }
    }

    pub fn detect_colors_in_area(&self, colors: &[Rgb<u8>], area: Rect, tolerance: u8) -> bool {
        let region = match self.screen.capture_region(area) {
            Ok(region) => region,
            Err(err) => {
                log::error!("[matcher] cannot sample {area:?}: {err}");
                return false;
            }
        };
        let hit = region
            .pixels()
            .any(|pixel| colors.iter().any(|color| color_matches(pixel, color, tolerance)));
        if hit {
            log::debug!("[matcher] target colour present in {area:?}");
        }
        hit
    }

    pub fn wait_for_colors(
        &self,
        colors: &[Rgb<u8>],
        area: Rect,
        tolerance: u8,
        max_attempts: u32,
        interval: Duration,
    ) -> bool {
        for attempt in 1..=max_attempts {
            if self.detect_colors_in_area(colors, area, tolerance) {
                return true;
            }
            if attempt < max_attempts {
                self.clock.sleep(interval);
            }
        }
        log::error!("[matcher] colour never appeared in {area:?} after {max_attempts} samples");
        false
    }
}
