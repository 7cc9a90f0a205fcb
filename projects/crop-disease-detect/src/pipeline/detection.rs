use crate::error::ServiceError;
use crate::pipeline::labels::CropKind;
use crate::pipeline::types::{BBox, Detection, Inference};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;
use usls::models::RTDETR;
use usls::{Config, Image};

/// A raw box as reported by the model, before thresholding and labelling.
#[derive(Debug, Clone, Copy)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Something that turns a BGR frame into raw detections. Engines stay on
/// the thread that loaded them.
pub trait DetectionEngine {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<RawDetection>>;
}

/// Builds a detection engine from a model artifact on disk.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_path: &Path, kind: CropKind) -> Result<Box<dyn DetectionEngine>>;
}

/// Loads ONNX artifacts through USLS.
pub struct UslsLoader;

impl ModelLoader for UslsLoader {
    fn load(&self, model_path: &Path, kind: CropKind) -> Result<Box<dyn DetectionEngine>> {
        let path = model_path
            .to_str()
            .ok_or_else(|| anyhow!("Model path is not valid UTF-8: {:?}", model_path))?;
        Ok(Box::new(ObjectDetector::new(path, kind)?))
    }
}

/// A wrapper around the USLS RT-DETR model that handles BGR-to-RGB conversion
/// and corrects for aspect-ratio padding bugs in the underlying model library.
pub struct ObjectDetector {
    model: RTDETR,
}

impl ObjectDetector {
    /// Create a new detector with the given model path.
    pub fn new(model_path: &str, kind: CropKind) -> Result<Self> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(kind.labels());

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        Ok(Self { model })
    }
}

impl DetectionEngine for ObjectDetector {
    fn detect(&mut self, frame: &Mat) -> Result<Vec<RawDetection>> {
        let dynamic_image = mat_to_dynamic_image(frame)?;

        // Correction calculations (USLS RT-DETR bug workaround)
        let size = frame.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;
        let (x_corr, y_corr) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let results = self.model.forward(&[Image::from(dynamic_image)])?;
        let Some(y) = results.into_iter().next() else {
            return Ok(Vec::new());
        };

        let mut raw = Vec::with_capacity(y.hbbs.len());
        for hbb in y.hbbs {
            let Some(class_id) = hbb.id() else {
                tracing::debug!("Dropping box without class id");
                continue;
            };
            raw.push(RawDetection {
                class_id,
                confidence: hbb.confidence().unwrap_or(0.0),
                bbox: BBox {
                    x: hbb.xmin() * x_corr,
                    y: hbb.ymin() * y_corr,
                    w: hbb.width() * x_corr,
                    h: hbb.height() * y_corr,
                },
            });
        }
        Ok(raw)
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let width = size.width as u32;
    let height = size.height as u32;

    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();

    let img_buffer = ImageBuffer::<Rgb<u8>, _>::from_vec(width, height, buffer)
        .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

/// Detector bound to one crop kind: thresholds raw boxes, resolves labels,
/// and reports an explicit empty result when nothing qualifies.
pub struct Detector {
    kind: CropKind,
    model_path: PathBuf,
    engine: Box<dyn DetectionEngine>,
}

impl Detector {
    pub fn load(
        loader: &dyn ModelLoader,
        model_path: &Path,
        kind: CropKind,
    ) -> Result<Self, ServiceError> {
        if !model_path.is_file() {
            return Err(ServiceError::ModelNotFound(model_path.to_path_buf()));
        }

        let start = Instant::now();
        let engine = loader
            .load(model_path, kind)
            .map_err(|e| ServiceError::ModelLoad {
                path: model_path.to_path_buf(),
                reason: format!("{:#}", e),
            })?;
        tracing::info!(
            "Loaded {} model {} in {:.2}s",
            kind,
            model_path.display(),
            start.elapsed().as_secs_f64()
        );

        Ok(Self {
            kind,
            model_path: model_path.to_path_buf(),
            engine,
        })
    }

    /// Run the model on one frame and keep detections at or above `min_conf`,
    /// best first.
    pub fn infer(&mut self, frame: &Mat, min_conf: f32) -> Result<Inference, ServiceError> {
        let start = Instant::now();
        let raw = self.engine.detect(frame).map_err(|e| {
            anyhow!(
                "{} inference with {} failed: {:#}",
                self.kind,
                self.model_path.display(),
                e
            )
        })?;
        let elapsed_secs = start.elapsed().as_secs_f64();

        let mut detections = Vec::with_capacity(raw.len());
        for d in raw {
            if !d.confidence.is_finite() || d.confidence < min_conf {
                continue;
            }
            detections.push(Detection {
                class_id: d.class_id,
                label: self.kind.label(d.class_id)?.to_string(),
                confidence: d.confidence.clamp(0.0, 1.0),
                bbox: d.bbox,
            });
        }
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        Ok(Inference::from_detections(detections, elapsed_secs))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Engine that replays a fixed set of boxes on every frame.
    pub(crate) struct FixedEngine(pub Vec<RawDetection>);

    impl DetectionEngine for FixedEngine {
        fn detect(&mut self, _frame: &Mat) -> Result<Vec<RawDetection>> {
            Ok(self.0.clone())
        }
    }

    /// Loader that hands out `FixedEngine`s and counts how often it was asked.
    pub(crate) struct FixedLoader {
        pub boxes: Vec<RawDetection>,
        pub loads: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl FixedLoader {
        pub(crate) fn new(boxes: Vec<RawDetection>) -> Self {
            Self {
                boxes,
                loads: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }
    }

    impl ModelLoader for FixedLoader {
        fn load(&self, _model_path: &Path, _kind: CropKind) -> Result<Box<dyn DetectionEngine>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("truncated protobuf"));
            }
            Ok(Box::new(FixedEngine(self.boxes.clone())))
        }
    }

    pub(crate) fn raw(class_id: usize, confidence: f32) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            bbox: BBox {
                x: 10.0,
                y: 20.0,
                w: 100.0,
                h: 80.0,
            },
        }
    }

    fn blank_frame() -> Mat {
        Mat::new_rows_cols_with_default(
            48,
            64,
            opencv::core::CV_8UC3,
            opencv::core::Scalar::all(255.0),
        )
        .unwrap()
    }

    fn model_file(dir: &Path) -> PathBuf {
        let path = dir.join("rice_best.onnx");
        std::fs::write(&path, b"onnx").unwrap();
        path
    }

    #[test]
    fn test_load_missing_artifact_skips_loader() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = FixedLoader::new(vec![]);
        let result = Detector::load(&loader, &tmp.path().join("nope.onnx"), CropKind::Rice);

        assert!(matches!(result, Err(ServiceError::ModelNotFound(_))));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_load_failure_is_model_load_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut loader = FixedLoader::new(vec![]);
        loader.fail = true;
        let result = Detector::load(&loader, &model_file(tmp.path()), CropKind::Rice);

        match result {
            Err(ServiceError::ModelLoad { reason, .. }) => assert!(reason.contains("protobuf")),
            other => panic!("expected ModelLoad, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_infer_thresholds_sorts_and_labels() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = FixedLoader::new(vec![raw(0, 0.55), raw(2, 0.2), raw(1, 0.91)]);
        let mut detector = Detector::load(&loader, &model_file(tmp.path()), CropKind::Rice).unwrap();

        let inference = detector.infer(&blank_frame(), 0.5).unwrap();
        let Inference::Detected(result) = inference else {
            panic!("expected detections");
        };
        assert_eq!(
            result.labels(),
            vec!["Rice_Blast（稻瘟病）".to_string(), "Brown_Spot（褐斑病）".to_string()]
        );
        assert_eq!(result.confidences(), vec![0.91, 0.55]);
    }

    #[test]
    fn test_infer_below_threshold_is_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = FixedLoader::new(vec![raw(0, 0.1), raw(1, f32::NAN)]);
        let mut detector = Detector::load(&loader, &model_file(tmp.path()), CropKind::Rice).unwrap();

        let inference = detector.infer(&blank_frame(), 0.5).unwrap();
        assert!(matches!(inference, Inference::NoDetection { .. }));
    }

    #[test]
    fn test_infer_unknown_class_is_hard_error() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = FixedLoader::new(vec![raw(7, 0.9)]);
        let mut detector = Detector::load(&loader, &model_file(tmp.path()), CropKind::Rice).unwrap();

        let err = detector.infer(&blank_frame(), 0.5).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownClass { id: 7, .. }));
    }

    #[test]
    fn test_mat_to_dynamic_image_swaps_channels() {
        let mat = Mat::new_rows_cols_with_default(
            2,
            3,
            opencv::core::CV_8UC3,
            opencv::core::Scalar::new(255.0, 0.0, 0.0, 0.0),
        )
        .unwrap();
        let img = mat_to_dynamic_image(&mat).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 255]);
    }
}
