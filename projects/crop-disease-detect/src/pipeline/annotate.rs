use crate::pipeline::labels::CropKind;
use crate::pipeline::types::Detection;
use ab_glyph::{Font, FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use opencv::core::{Mat, Rect, Scalar};
use opencv::imgproc::{self, LINE_8};
use opencv::prelude::*;
use std::collections::BTreeSet;
use std::path::Path;

/// Label face shipped with the binary.
const BUNDLED_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans.ttf");

const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
const LABEL_PADDING: i32 = 4;

/// BGR colours cycled by class id.
const PALETTE: [(f64, f64, f64); 6] = [
    (56.0, 56.0, 255.0),
    (151.0, 157.0, 255.0),
    (31.0, 112.0, 255.0),
    (29.0, 178.0, 255.0),
    (49.0, 210.0, 207.0),
    (10.0, 249.0, 72.0),
];

/// A caption split into runs that share one font of the stack.
type Runs = Vec<(usize, String)>;

/// Draws detection boxes and labels onto frames.
///
/// Captions are set with a font stack: the configured font (if any) first,
/// then the bundled face. Each character uses the first font that has a
/// glyph for it; characters no font covers are left out.
pub struct Annotator {
    fonts: Vec<FontArc>,
}

impl Annotator {
    pub fn new(font_path: Option<&Path>) -> Result<Self> {
        let mut fonts = Vec::with_capacity(2);
        if let Some(path) = font_path {
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read font {}", path.display()))?;
            let font = FontArc::try_from_vec(data)
                .map_err(|e| anyhow!("Invalid font {}: {}", path.display(), e))?;
            tracing::info!("Loaded label font from {}", path.display());
            fonts.push(font);
        }
        let bundled = FontArc::try_from_slice(BUNDLED_FONT)
            .map_err(|e| anyhow!("Bundled label font is invalid: {}", e))?;
        fonts.push(bundled);

        let annotator = Self { fonts };
        let missing = annotator.uncovered_label_chars();
        if !missing.is_empty() {
            let sample: String = missing.iter().take(8).collect();
            tracing::warn!(
                "{} label characters have no glyph in the loaded fonts (e.g. '{}'); \
                 pass --font-path with a CJK face to render them",
                missing.len(),
                sample
            );
        }
        Ok(annotator)
    }

    /// Return a copy of `frame` with every detection drawn on it.
    pub fn annotate(&self, frame: &Mat, detections: &[Detection]) -> Result<Mat> {
        let mut canvas = frame.try_clone()?;
        let bounds = Rect::new(0, 0, canvas.cols(), canvas.rows());

        let mut captions = Vec::with_capacity(detections.len());
        for d in detections {
            let color = class_color(d.class_id);
            let rect = intersect(
                Rect::new(
                    d.bbox.x.round() as i32,
                    d.bbox.y.round() as i32,
                    d.bbox.w.round().max(1.0) as i32,
                    d.bbox.h.round().max(1.0) as i32,
                ),
                bounds,
            );
            if rect.width <= 0 || rect.height <= 0 {
                continue;
            }
            imgproc::rectangle(&mut canvas, rect, color, BOX_THICKNESS, LINE_8, 0)?;

            let runs = self.layout(&format!("{} {:.2}", d.label, d.confidence));
            let (text_w, text_h) = self.runs_size(&runs);
            let bg_h = text_h + 2 * LABEL_PADDING;
            let bg_y = if rect.y >= bg_h { rect.y - bg_h } else { rect.y };
            let background = intersect(
                Rect::new(rect.x, bg_y, text_w + 2 * LABEL_PADDING, bg_h),
                bounds,
            );
            imgproc::rectangle(&mut canvas, background, color, imgproc::FILLED, LINE_8, 0)?;
            captions.push((runs, background.x + LABEL_PADDING, bg_y + LABEL_PADDING));
        }

        self.draw_captions(&mut canvas, &captions)?;
        Ok(canvas)
    }

    fn font_for(&self, c: char) -> Option<usize> {
        self.fonts.iter().position(|f| f.glyph_id(c).0 != 0)
    }

    /// Assign every character to a font. Fullwidth brackets become ASCII
    /// ones, and brackets left empty by dropped characters are removed.
    fn layout(&self, text: &str) -> Runs {
        let mut glyphs: Vec<(usize, char)> = Vec::with_capacity(text.len());
        for c in text.chars().map(halfwidth) {
            let Some(font) = self.font_for(c) else {
                continue;
            };
            if c == ')' && matches!(glyphs.last(), Some((_, '('))) {
                glyphs.pop();
                continue;
            }
            glyphs.push((font, c));
        }

        let mut runs: Runs = Vec::new();
        for (font, c) in glyphs {
            match runs.last_mut() {
                Some((last, run)) if *last == font => run.push(c),
                _ => runs.push((font, c.to_string())),
            }
        }
        runs
    }

    fn runs_size(&self, runs: &Runs) -> (i32, i32) {
        let mut width = 0;
        let mut height = 0;
        for (font, run) in runs {
            let (w, h) =
                imageproc::drawing::text_size(PxScale::from(LABEL_SCALE), &self.fonts[*font], run);
            width += w as i32;
            height = height.max(h as i32);
        }
        (width, height.max(LABEL_SCALE as i32))
    }

    fn uncovered_label_chars(&self) -> BTreeSet<char> {
        CropKind::ALL
            .iter()
            .flat_map(|kind| kind.labels().iter())
            .flat_map(|label| label.chars())
            .map(halfwidth)
            .filter(|c| self.font_for(*c).is_none())
            .collect()
    }

    /// Render captions onto the frame's pixels. The buffer is BGR, so white
    /// is the only colour used and channel order does not matter.
    fn draw_captions(&self, canvas: &mut Mat, captions: &[(Runs, i32, i32)]) -> Result<()> {
        if captions.is_empty() {
            return Ok(());
        }
        if !canvas.is_continuous() || canvas.channels() != 3 {
            return Err(anyhow!("Annotated frame must be a continuous 3-channel Mat"));
        }

        let width = canvas.cols() as u32;
        let height = canvas.rows() as u32;
        let mut view = RgbImage::from_raw(width, height, canvas.data_bytes()?.to_vec())
            .ok_or_else(|| anyhow!("Frame buffer does not match its dimensions"))?;

        let scale = PxScale::from(LABEL_SCALE);
        for (runs, x, y) in captions {
            let mut cursor = *x;
            for (font, run) in runs {
                let font = &self.fonts[*font];
                imageproc::drawing::draw_text_mut(
                    &mut view,
                    Rgb([255, 255, 255]),
                    cursor,
                    *y,
                    scale,
                    font,
                    run,
                );
                cursor += imageproc::drawing::text_size(scale, font, run).0 as i32;
            }
        }

        canvas.data_bytes_mut()?.copy_from_slice(view.as_raw());
        Ok(())
    }
}

fn halfwidth(c: char) -> char {
    match c {
        '（' => '(',
        '）' => ')',
        other => other,
    }
}

fn intersect(a: Rect, b: Rect) -> Rect {
    let x = a.x.max(b.x);
    let y = a.y.max(b.y);
    let right = (a.x + a.width).min(b.x + b.width);
    let bottom = (a.y + a.height).min(b.y + b.height);
    Rect::new(x, y, (right - x).max(0), (bottom - y).max(0))
}

fn class_color(class_id: usize) -> Scalar {
    let (b, g, r) = PALETTE[class_id % PALETTE.len()];
    Scalar::new(b, g, r, 0.0)
}
