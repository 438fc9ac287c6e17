//! Deterministic approximator used by agent and trainer tests

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::policy::{ModelError, Net, QFunction};

/// Fit calls recorded by [`StubQ`]
#[derive(Debug, Default)]
pub struct FitLog {
    pub calls: usize,
    pub inputs: Vec<Vec<f32>>,
    pub labels: Vec<Vec<f32>>,
}

/// Returns fixed output rows regardless of the input; `fit` moves the online row
/// towards the mean label
pub struct StubQ {
    pub input_size: usize,
    pub online: Vec<f32>,
    pub target: Vec<f32>,
    pub fit_delay: Duration,
    /// `fit` records the call, then fails
    pub fail_fit: bool,
    pub log: Arc<Mutex<FitLog>>,
}

impl StubQ {
    pub fn new(input_size: usize, online: Vec<f32>) -> Self {
        Self {
            input_size,
            target: online.clone(),
            online,
            fit_delay: Duration::ZERO,
            fail_fit: false,
            log: Arc::new(Mutex::new(FitLog::default())),
        }
    }

    pub fn with_target(mut self, target: Vec<f32>) -> Self {
        self.target = target;
        self
    }

    pub fn with_fit_delay(mut self, delay: Duration) -> Self {
        self.fit_delay = delay;
        self
    }

    pub fn with_failing_fit(mut self) -> Self {
        self.fail_fit = true;
        self
    }
}

impl QFunction for StubQ {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.online.len()
    }

    fn predict_batch(&self, net: Net, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        let row = match net {
            Net::Online => &self.online,
            Net::Target => &self.target,
        };
        inputs
            .iter()
            .map(|input| {
                if input.len() == self.input_size {
                    Ok(row.clone())
                } else {
                    Err(ModelError::Shape {
                        expected: self.input_size,
                        got: input.len(),
                    })
                }
            })
            .collect()
    }

    fn fit(&mut self, inputs: &[Vec<f32>], labels: &[Vec<f32>]) -> Result<f32, ModelError> {
        if !self.fit_delay.is_zero() {
            std::thread::sleep(self.fit_delay);
        }
        let mut log = self.log.lock().unwrap();
        log.calls += 1;
        log.inputs.extend_from_slice(inputs);
        log.labels.extend_from_slice(labels);
        if self.fail_fit {
            return Err(ModelError::Tensor("fit failed".to_string()));
        }

        let n = labels.len().max(1) as f32;
        let mut loss = 0.0;
        let mut mean = vec![0.0; self.online.len()];
        for label in labels {
            for (i, v) in label.iter().enumerate() {
                mean[i] += v / n;
                loss += (v - self.online[i]).powi(2);
            }
        }
        self.online = mean;
        Ok(loss / n)
    }

    fn sync_target(&mut self) {
        self.target = self.online.clone();
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let json = serde_json::to_string(&(&self.online, &self.target))
            .map_err(|e| ModelError::Record(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ModelError::Record(e.to_string()))
    }

    fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let json = std::fs::read_to_string(path).map_err(|e| ModelError::Record(e.to_string()))?;
        let (online, target): (Vec<f32>, Vec<f32>) =
            serde_json::from_str(&json).map_err(|e| ModelError::Record(e.to_string()))?;
        self.online = online;
        self.target = target;
        Ok(())
    }
}
