//! ONNX model loader — inference sessions for low-latency edge prediction
//!
//! Loads ONNX artifacts with streaming SHA-256 verification, builds an
//! optimized tract plan with a pinned `[1, n_features]` input, decodes the
//! model's output arity into a typed payload and keeps a bounded ring of
//! latency samples per model.
//!
//! Inference is synchronous. Async callers must offload through
//! `tokio::task::spawn_blocking`; the inference service bounds concurrency
//! with a semaphore sized for the edge CPU.

use crate::config::defaults::{INFERENCE_WARN_MS, LATENCY_RING_CAPACITY, LOAD_TIME_WARN_SECS};
use crate::error::{EdgeError, Result};
use crate::types::{ModelMetadata, OutputFormat};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, info, warn};

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// One decoded prediction target with optional interval and confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetEstimate {
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub confidence: Option<f64>,
}

impl TargetEstimate {
    fn point(value: f64) -> Self {
        Self {
            value,
            lower: None,
            upper: None,
            confidence: None,
        }
    }
}

/// Decoded multi-output prediction.
#[derive(Debug, Clone)]
pub struct PredictionPayload {
    pub settlement: TargetEstimate,
    pub displacement: Option<TargetEstimate>,
    pub groundwater: Option<TargetEstimate>,
    pub inference_time_ms: f64,
}

/// Latency distribution over the bounded sample ring.
#[derive(Debug, Clone, Copy)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub num_inferences: usize,
}

/// Load outcome reported back to the registry for persistence.
#[derive(Debug, Clone, Copy)]
pub struct LoadReport {
    pub load_time_seconds: f64,
    pub model_size_bytes: i64,
}

/// Input/output arity of a loaded session.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_name: String,
    pub input_len: usize,
    pub num_outputs: usize,
}

struct LoadedModel {
    plan: OnnxPlan,
    format: Option<OutputFormat>,
    input_len: usize,
    num_outputs: usize,
}

/// Loads and manages ONNX inference sessions.
pub struct ModelLoader {
    models_dir: PathBuf,
    sessions: RwLock<HashMap<String, Arc<LoadedModel>>>,
    latencies: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl ModelLoader {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            sessions: RwLock::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a possibly-relative artifact path against the models dir.
    fn resolve_path(&self, artifact_path: &str) -> PathBuf {
        let path = Path::new(artifact_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.models_dir.join(path)
        }
    }

    /// Load an ONNX artifact and prepare it for inference.
    ///
    /// Verifies the SHA-256 checksum (when requested and present in the
    /// metadata), builds the optimized plan with the input pinned to
    /// `[1, |feature_list|]`, and optionally runs one zero-tensor warm-up.
    pub fn load(
        &self,
        metadata: &ModelMetadata,
        verify_checksum: bool,
        warm_up: bool,
    ) -> Result<LoadReport> {
        let started = Instant::now();
        let path = self.resolve_path(&metadata.artifact_path);

        if !path.exists() {
            return Err(EdgeError::ModelUnavailable {
                model_name: metadata.model_name.clone(),
                detail: format!("artifact not found: {}", path.display()),
            });
        }

        if verify_checksum {
            if let Some(expected) = &metadata.checksum {
                let actual = sha256_file(&path)?;
                if &actual != expected {
                    return Err(EdgeError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }

        let n_features = metadata.feature_list.0.len();

        let mut builder = tract_onnx::onnx()
            .model_for_path(&path)
            .map_err(|e| EdgeError::Session(e.to_string()))?;

        if n_features > 0 {
            builder = builder
                .with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, n_features)),
                )
                .map_err(|e| EdgeError::Session(e.to_string()))?;
        }

        let plan = builder
            .into_optimized()
            .map_err(|e| EdgeError::Session(e.to_string()))?
            .into_runnable()
            .map_err(|e| EdgeError::Session(e.to_string()))?;

        let num_outputs = plan.model().outputs.len();
        let model_size_bytes = std::fs::metadata(&path)?.len() as i64;

        let loaded = Arc::new(LoadedModel {
            plan,
            format: metadata.output_format_version,
            input_len: n_features,
            num_outputs,
        });

        if warm_up {
            self.warm_up(&metadata.model_name, &loaded);
        }

        {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.insert(metadata.model_name.clone(), loaded);
        }
        {
            let mut latencies = self
                .latencies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            latencies
                .entry(metadata.model_name.clone())
                .or_insert_with(|| VecDeque::with_capacity(LATENCY_RING_CAPACITY));
        }

        let load_time_seconds = started.elapsed().as_secs_f64();
        info!(
            model = %metadata.model_name,
            load_time_s = format!("{load_time_seconds:.2}"),
            size_mb = format!("{:.1}", model_size_bytes as f64 / 1_048_576.0),
            outputs = num_outputs,
            "Model loaded"
        );

        if load_time_seconds > LOAD_TIME_WARN_SECS {
            warn!(
                model = %metadata.model_name,
                load_time_s = format!("{load_time_seconds:.2}"),
                "Model load time exceeds target"
            );
        }

        Ok(LoadReport {
            load_time_seconds,
            model_size_bytes,
        })
    }

    fn warm_up(&self, model_name: &str, loaded: &LoadedModel) {
        // dynamic dims resolve to 1 for the dummy tensor
        let len = loaded.input_len.max(1);
        match run_plan(&loaded.plan, &vec![0.0_f32; len]) {
            Ok(_) => debug!(model = model_name, "Model warmed up"),
            Err(e) => warn!(model = model_name, error = %e, "Warm-up failed"),
        }
    }

    /// Run one inference on a `[1, n]` feature row.
    ///
    /// Times the call at sub-millisecond resolution and appends to the
    /// model's bounded latency ring.
    pub fn predict(&self, model_name: &str, features: &[f32]) -> Result<PredictionPayload> {
        let loaded = {
            let sessions = self
                .sessions
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions
                .get(model_name)
                .cloned()
                .ok_or_else(|| EdgeError::ModelUnavailable {
                    model_name: model_name.to_string(),
                    detail: "not loaded".to_string(),
                })?
        };

        let started = Instant::now();
        let outputs = run_plan(&loaded.plan, features)?;
        let inference_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.record_latency(model_name, inference_time_ms);

        if inference_time_ms > INFERENCE_WARN_MS {
            warn!(
                model = model_name,
                latency_ms = format!("{inference_time_ms:.2}"),
                "Inference latency exceeds target"
            );
        }

        let mut payload = decode_outputs(&outputs, loaded.format, model_name);
        payload.inference_time_ms = inference_time_ms;
        Ok(payload)
    }

    fn record_latency(&self, model_name: &str, latency_ms: f64) {
        let mut latencies = self
            .latencies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ring = latencies.entry(model_name.to_string()).or_default();
        if ring.len() >= LATENCY_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(latency_ms);
    }

    /// Latency statistics for a model, or None before its first inference.
    pub fn performance_stats(&self, model_name: &str) -> Option<LatencyStats> {
        let latencies = self
            .latencies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ring = latencies.get(model_name)?;
        if ring.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = ring.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        Some(LatencyStats {
            mean_ms: sorted.iter().sum::<f64>() / sorted.len() as f64,
            median_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            num_inferences: sorted.len(),
        })
    }

    /// Average latency over the current ring (persisted into metadata).
    pub fn avg_inference_time_ms(&self, model_name: &str) -> Option<f64> {
        self.performance_stats(model_name).map(|s| s.mean_ms)
    }

    pub fn model_info(&self, model_name: &str) -> Option<ModelInfo> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.get(model_name).map(|m| ModelInfo {
            model_name: model_name.to_string(),
            input_len: m.input_len,
            num_outputs: m.num_outputs,
        })
    }

    pub fn is_loaded(&self, model_name: &str) -> bool {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.contains_key(model_name)
    }

    pub fn loaded_models(&self) -> Vec<String> {
        let sessions = self
            .sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.keys().cloned().collect()
    }

    /// Drop a model's session and latency ring.
    pub fn unload(&self, model_name: &str) {
        let removed = {
            let mut sessions = self
                .sessions
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions.remove(model_name).is_some()
        };
        let mut latencies = self
            .latencies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        latencies.remove(model_name);

        if removed {
            info!(model = model_name, "Model unloaded");
        }
    }
}

fn run_plan(plan: &OnnxPlan, features: &[f32]) -> Result<Vec<f64>> {
    let input = tract_ndarray::Array2::from_shape_vec((1, features.len()), features.to_vec())
        .map_err(|e| EdgeError::Session(e.to_string()))?;
    let tensor: Tensor = input.into();

    let outputs = plan
        .run(tvec!(tensor.into()))
        .map_err(|e| EdgeError::Session(e.to_string()))?;

    let mut values = Vec::with_capacity(outputs.len());
    for output in outputs.iter() {
        let cast = output
            .cast_to::<f32>()
            .map_err(|e| EdgeError::Session(e.to_string()))?;
        let view = cast
            .to_array_view::<f32>()
            .map_err(|e| EdgeError::Session(e.to_string()))?;
        let first = view
            .iter()
            .next()
            .copied()
            .ok_or_else(|| EdgeError::Session("empty model output".to_string()))?;
        values.push(first as f64);
    }
    Ok(values)
}

/// Decode raw model outputs into typed targets based on output count.
///
/// | K  | layout |
/// |----|--------|
/// | 1  | settlement |
/// | 2  | v2: settlement+confidence; v1 or unset (warns): settlement+lower |
/// | 3  | settlement, lower, upper |
/// | 4  | settlement, confidence, lower, upper |
/// | 6  | 2 targets × (value, lower, upper) |
/// | 8  | 2 targets × (value, confidence, lower, upper) |
/// | 9  | 3 targets × (value, lower, upper) |
/// | 12 | 3 targets × (value, confidence, lower, upper) |
///
/// Any other count falls back to output[0] as the settlement with a warning.
pub fn decode_outputs(
    outputs: &[f64],
    format: Option<OutputFormat>,
    model_name: &str,
) -> PredictionPayload {
    let triple = |v: f64, l: f64, u: f64| TargetEstimate {
        value: v,
        lower: Some(l),
        upper: Some(u),
        confidence: None,
    };
    let quad = |v: f64, c: f64, l: f64, u: f64| TargetEstimate {
        value: v,
        lower: Some(l),
        upper: Some(u),
        confidence: Some(c),
    };

    let mut settlement = TargetEstimate::point(outputs.first().copied().unwrap_or(f64::NAN));
    let mut displacement = None;
    let mut groundwater = None;

    match outputs.len() {
        1 => {}
        2 => match format {
            Some(OutputFormat::V2Confidence) => {
                settlement.confidence = Some(outputs[1]);
            }
            Some(OutputFormat::V1LowerBound) => {
                settlement.lower = Some(outputs[1]);
            }
            None => {
                warn!(
                    model = model_name,
                    "2-output model has no output_format_version; defaulting to legacy \
                     [settlement, lower_bound] layout"
                );
                settlement.lower = Some(outputs[1]);
            }
        },
        3 => settlement = triple(outputs[0], outputs[1], outputs[2]),
        4 => settlement = quad(outputs[0], outputs[1], outputs[2], outputs[3]),
        6 => {
            settlement = triple(outputs[0], outputs[1], outputs[2]);
            displacement = Some(triple(outputs[3], outputs[4], outputs[5]));
        }
        8 => {
            settlement = quad(outputs[0], outputs[1], outputs[2], outputs[3]);
            displacement = Some(quad(outputs[4], outputs[5], outputs[6], outputs[7]));
        }
        9 => {
            settlement = triple(outputs[0], outputs[1], outputs[2]);
            displacement = Some(triple(outputs[3], outputs[4], outputs[5]));
            groundwater = Some(triple(outputs[6], outputs[7], outputs[8]));
        }
        12 => {
            settlement = quad(outputs[0], outputs[1], outputs[2], outputs[3]);
            displacement = Some(quad(outputs[4], outputs[5], outputs[6], outputs[7]));
            groundwater = Some(quad(outputs[8], outputs[9], outputs[10], outputs[11]));
        }
        other => {
            warn!(
                model = model_name,
                num_outputs = other,
                "Unsupported output count; using first output as settlement"
            );
        }
    }

    PredictionPayload {
        settlement,
        displacement,
        groundwater,
        inference_time_ms: 0.0,
    }
}

/// Streaming SHA-256 of a file, hex-encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Linear-interpolation percentile over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        sorted[low]
    } else {
        let weight = rank - low as f64;
        sorted[low] * (1.0 - weight) + sorted[high] * weight
    }
}
