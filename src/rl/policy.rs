//! Q-value approximators: the trait the learning agent trains through, and the Burn MLP behind it

use std::fmt;
use std::path::Path;

use burn::module::Module;
use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::{Linear, LinearConfig, Relu};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Which of the two networks to query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Net {
    Online,
    Target,
}

#[derive(Debug)]
pub enum ModelError {
    /// Input or label width does not match the network
    Shape { expected: usize, got: usize },
    /// Inputs and labels disagree in count, or a batch is empty
    Batch(String),
    Tensor(String),
    Record(String),
    /// The learning agent was built without an approximator
    Missing,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Shape { expected, got } => {
                write!(f, "Shape mismatch: expected {} values, got {}", expected, got)
            }
            ModelError::Batch(msg) => write!(f, "Invalid batch: {}", msg),
            ModelError::Tensor(msg) => write!(f, "Tensor error: {}", msg),
            ModelError::Record(msg) => write!(f, "Record error: {}", msg),
            ModelError::Missing => write!(f, "No model attached"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Function approximator with an online network that is trained and a target network
/// that is only refreshed by `sync_target`.
pub trait QFunction: Send + 'static {
    fn input_size(&self) -> usize;

    fn output_size(&self) -> usize;

    /// Row-wise predictions for a batch of inputs
    fn predict_batch(&self, net: Net, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError>;

    fn predict(&self, net: Net, input: &[f32]) -> Result<Vec<f32>, ModelError> {
        self.predict_batch(net, &[input.to_vec()])?
            .pop()
            .ok_or_else(|| ModelError::Batch("empty prediction".into()))
    }

    /// One training epoch of the online network on `(inputs, labels)`; returns the mean loss
    fn fit(&mut self, inputs: &[Vec<f32>], labels: &[Vec<f32>]) -> Result<f32, ModelError>;

    /// Copy online weights into the target network
    fn sync_target(&mut self);

    fn save(&self, path: &Path) -> Result<(), ModelError>;

    fn load(&mut self, path: &Path) -> Result<(), ModelError>;
}

/// Shape of the MLP and how fit batches are cut
#[derive(Debug, Config)]
pub struct NetworkConfig {
    #[config(default = 128)]
    pub hidden_size: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 32)]
    pub mini_batch_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Fully connected Q network over a flattened state window
#[derive(Module, Debug)]
pub struct QNetwork<B: Backend> {
    input: Linear<B>,
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> QNetwork<B> {
    pub fn new(
        device: &B::Device,
        input_size: usize,
        output_size: usize,
        config: &NetworkConfig,
    ) -> Self {
        let input = LinearConfig::new(input_size, config.hidden_size).init(device);

        let mut hidden = Vec::new();
        for _ in 1..config.num_layers.max(1) {
            hidden.push(LinearConfig::new(config.hidden_size, config.hidden_size).init(device));
        }

        let output = LinearConfig::new(config.hidden_size, output_size).init(device);

        Self {
            input,
            hidden,
            output,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = self.activation.forward(self.input.forward(x));

        for layer in &self.hidden {
            x = self.activation.forward(layer.forward(x));
        }

        self.output.forward(x)
    }
}

/// [`QFunction`] backed by two Burn MLPs and a persistent Adam optimizer
pub struct BurnQFunction<B: AutodiffBackend> {
    online: QNetwork<B>,
    target: QNetwork<B>,
    optimizer: OptimizerAdaptor<Adam, QNetwork<B>, B>,
    device: B::Device,
    input_size: usize,
    output_size: usize,
    learning_rate: f64,
    mini_batch_size: usize,
    rng: StdRng,
}

impl<B: AutodiffBackend> BurnQFunction<B> {
    pub fn new(
        device: B::Device,
        input_size: usize,
        output_size: usize,
        config: &NetworkConfig,
        learning_rate: f64,
        seed: Option<u64>,
    ) -> Self {
        let online = QNetwork::new(&device, input_size, output_size, config);
        let target = online.clone();
        let optimizer = AdamConfig::new().init::<B, QNetwork<B>>();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            online,
            target,
            optimizer,
            device,
            input_size,
            output_size,
            learning_rate,
            mini_batch_size: config.mini_batch_size.max(1),
            rng,
        }
    }

    fn batch_to_tensor(&self, rows: &[&Vec<f32>], width: usize) -> Result<Tensor<B, 2>, ModelError> {
        let mut flat = Vec::with_capacity(rows.len() * width);
        for row in rows {
            if row.len() != width {
                return Err(ModelError::Shape {
                    expected: width,
                    got: row.len(),
                });
            }
            flat.extend_from_slice(row);
        }
        Ok(Tensor::<B, 1>::from_floats(flat.as_slice(), &self.device).reshape([rows.len(), width]))
    }

    fn network(&self, net: Net) -> &QNetwork<B> {
        match net {
            Net::Online => &self.online,
            Net::Target => &self.target,
        }
    }
}

impl<B: AutodiffBackend> QFunction for BurnQFunction<B> {
    fn input_size(&self) -> usize {
        self.input_size
    }

    fn output_size(&self) -> usize {
        self.output_size
    }

    fn predict_batch(&self, net: Net, inputs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<&Vec<f32>> = inputs.iter().collect();
        let input = self.batch_to_tensor(&rows, self.input_size)?;
        let values = self
            .network(net)
            .forward(input)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| ModelError::Tensor(format!("{:?}", e)))?;

        Ok(values
            .chunks(self.output_size)
            .map(|row| row.to_vec())
            .collect())
    }

    fn fit(&mut self, inputs: &[Vec<f32>], labels: &[Vec<f32>]) -> Result<f32, ModelError> {
        if inputs.len() != labels.len() {
            return Err(ModelError::Batch(format!(
                "{} inputs but {} labels",
                inputs.len(),
                labels.len()
            )));
        }
        if inputs.is_empty() {
            return Err(ModelError::Batch("no samples".into()));
        }

        let mut indices: Vec<usize> = (0..inputs.len()).collect();
        indices.shuffle(&mut self.rng);

        let mut total_loss = 0.0;
        let mut num_batches = 0;
        for chunk in indices.chunks(self.mini_batch_size) {
            let batch_inputs: Vec<&Vec<f32>> = chunk.iter().map(|&i| &inputs[i]).collect();
            let batch_labels: Vec<&Vec<f32>> = chunk.iter().map(|&i| &labels[i]).collect();
            let x = self.batch_to_tensor(&batch_inputs, self.input_size)?;
            let y = self.batch_to_tensor(&batch_labels, self.output_size)?;

            let predicted = self.online.forward(x);
            let loss = MseLoss::new().forward(predicted, y, Reduction::Mean);
            let loss_value = loss
                .clone()
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| ModelError::Tensor(format!("{:?}", e)))?
                .first()
                .copied()
                .unwrap_or(0.0);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.online);
            self.online = self
                .optimizer
                .step(self.learning_rate, self.online.clone(), grads);

            total_loss += loss_value;
            num_batches += 1;
        }

        Ok(total_loss / num_batches as f32)
    }

    fn sync_target(&mut self) {
        self.target = self.online.clone();
    }

    fn save(&self, path: &Path) -> Result<(), ModelError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.online
            .clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|e| ModelError::Record(format!("{:?}", e)))?;
        tracing::debug!("Saved model to {}", path.display());
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.online = self
            .online
            .clone()
            .load_file(path.to_path_buf(), &recorder, &self.device)
            .map_err(|e| ModelError::Record(format!("{:?}", e)))?;
        self.target = self.online.clone();
        tracing::info!("Loaded model from {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;

    type TestBackend = Autodiff<NdArray>;

    fn small_network() -> BurnQFunction<TestBackend> {
        let config = NetworkConfig::new().with_hidden_size(16).with_mini_batch_size(4);
        BurnQFunction::new(Default::default(), 6, 3, &config, 1e-2, Some(7))
    }

    fn samples() -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
        let inputs: Vec<Vec<f32>> = (0..8)
            .map(|i| (0..6).map(|j| ((i + j) % 5) as f32 * 0.2).collect())
            .collect();
        let labels: Vec<Vec<f32>> = (0..8).map(|i| vec![i as f32 * 0.1, 1.0, -1.0]).collect();
        (inputs, labels)
    }

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.hidden_size, 128);
        assert_eq!(config.num_layers, 2);
        assert_eq!(config.mini_batch_size, 32);
    }

    #[test]
    fn test_predict_shapes() {
        let q = small_network();
        let (inputs, _) = samples();
        let out = q.predict_batch(Net::Online, &inputs).unwrap();
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|row| row.len() == 3));
        assert!(matches!(
            q.predict(Net::Online, &[0.0; 5]),
            Err(ModelError::Shape { expected: 6, got: 5 })
        ));
    }

    #[test]
    fn test_target_diverges_until_synced() {
        let mut q = small_network();
        let (inputs, labels) = samples();
        let sample_input = &inputs[3];

        assert_eq!(
            q.predict(Net::Online, sample_input).unwrap(),
            q.predict(Net::Target, sample_input).unwrap()
        );

        for _ in 0..5 {
            let loss = q.fit(&inputs, &labels).unwrap();
            assert!(loss.is_finite());
        }
        assert_ne!(
            q.predict(Net::Online, sample_input).unwrap(),
            q.predict(Net::Target, sample_input).unwrap()
        );

        q.sync_target();
        assert_eq!(
            q.predict(Net::Online, sample_input).unwrap(),
            q.predict(Net::Target, sample_input).unwrap()
        );
    }

    #[test]
    fn test_fit_reduces_loss() {
        let mut q = small_network();
        let (inputs, labels) = samples();
        let first = q.fit(&inputs, &labels).unwrap();
        let mut last = first;
        for _ in 0..100 {
            last = q.fit(&inputs, &labels).unwrap();
        }
        assert!(last < first, "loss went from {} to {}", first, last);
    }

    #[test]
    fn test_fit_rejects_mismatched_batch() {
        let mut q = small_network();
        let (inputs, labels) = samples();
        assert!(q.fit(&inputs, &labels[..3]).is_err());
        assert!(q.fit(&[], &[]).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeker");
        let (inputs, labels) = samples();

        let mut trained = small_network();
        for _ in 0..3 {
            trained.fit(&inputs, &labels).unwrap();
        }
        trained.save(&path).unwrap();

        let mut restored = small_network();
        restored.load(&path).unwrap();
        let a = trained.predict(Net::Online, &inputs[0]).unwrap();
        let b = restored.predict(Net::Online, &inputs[0]).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
        assert_eq!(b, restored.predict(Net::Target, &inputs[0]).unwrap());
    }
}
