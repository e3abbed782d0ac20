// Copyright (C) 2023 QuerentAI LLC.
// This file is part of Querent.

// The Licensed Work is licensed under the Business Source License 1.1 (BSL 1.1).
// You may use this file in compliance with the BSL 1.1, subject to the following restrictions:
// 1. You may not use the Licensed Work for AI-related services, database services,
//    or any service or product offering that provides database, big data, or analytics
//    services to third parties unless explicitly authorized by QuerentAI LLC.
// 2. For more details, see the LICENSE file or visit https://mariadb.com/bsl11/.

// For inquiries about alternative licensing arrangements, please contact contact@querent.xyz.

// The Licensed Work is provided "AS IS", WITHOUT WARRANTY OF ANY KIND, express or implied,
// including but not limited to the warranties of merchantability, fitness for a particular purpose,
// and non-infringement. See the Business Source License for more details.

// This software includes code developed by QuerentAI LLC (https://querent.xyz).

use crate::{
	error::{ClassifierError, ClassifierErrorKind, ClassifierResult},
	transformers::{
		bert::multilabel::{BertForMultiLabelSequenceClassification, ClassifierConfig},
		modelling_outputs::SequenceClassifierOutput,
	},
};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{Config as BertConfig, DTYPE};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use std::{path::PathBuf, sync::Arc};
use tokenizers::{PaddingParams, Tokenizer};

#[derive(
	Debug, Clone, Copy, Default, Hash, PartialEq, Eq, serde::Deserialize, serde::Serialize,
)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
enum WeightSource {
	#[default]
	Safetensors,
	Pytorch,
}

/// Where to find a fine-tuned multi-label checkpoint.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ClassifierOptions {
	pub model: String,
	pub revision: Option<String>,
	pub local_dir: Option<String>,
	pub cache_dir: Option<PathBuf>,
}

impl ClassifierOptions {
	pub fn new(model: impl Into<String>) -> Self {
		Self { model: model.into(), revision: None, local_dir: None, cache_dir: None }
	}
}

impl Default for ClassifierOptions {
	fn default() -> Self {
		Self::new("bert-base-uncased")
	}
}

/// Resolve configuration, tokenizer, and weight files from a local directory
/// or the Hugging Face hub, preferring safetensors over PyTorch archives.
fn resolve_model_files(
	options: &ClassifierOptions,
) -> ClassifierResult<(PathBuf, PathBuf, PathBuf, WeightSource)> {
	if let Some(local_dir) = &options.local_dir {
		let config_filename = PathBuf::from(format!("{}/config.json", local_dir));
		let tokenizer_filename = PathBuf::from(format!("{}/tokenizer.json", local_dir));
		let (weights_filename, weight_source) = {
			let safetensors_path = PathBuf::from(format!("{}/model.safetensors", local_dir));
			let pytorch_path = PathBuf::from(format!("{}/pytorch_model.bin", local_dir));

			if safetensors_path.exists() {
				(safetensors_path, WeightSource::Safetensors)
			} else if pytorch_path.exists() {
				(pytorch_path, WeightSource::Pytorch)
			} else {
				return Err(ClassifierError::new(
					ClassifierErrorKind::NotFound,
					Arc::new(anyhow::anyhow!("could not find model weights in local directory")),
				));
			}
		};
		Ok((config_filename, tokenizer_filename, weights_filename, weight_source))
	} else {
		let repo = match &options.revision {
			Some(revision) =>
				Repo::with_revision(options.model.clone(), RepoType::Model, revision.to_string()),
			None => Repo::model(options.model.clone()),
		};
		let mut builder = ApiBuilder::new();
		if let Some(cache_dir) = &options.cache_dir {
			builder = builder.with_cache_dir(cache_dir.clone());
		}
		let api = builder.build().map_err(|e| {
			ClassifierError::new(
				ClassifierErrorKind::Io,
				Arc::new(anyhow::anyhow!("could not initialize Hugging Face API: {}", e)),
			)
		})?;
		let api = api.repo(repo);
		let config = api.get("config.json").map_err(|e| {
			ClassifierError::new(
				ClassifierErrorKind::Io,
				Arc::new(anyhow::anyhow!("could not fetch config.json: {}", e)),
			)
		})?;
		let tokenizer = api.get("tokenizer.json").map_err(|e| {
			ClassifierError::new(
				ClassifierErrorKind::Io,
				Arc::new(anyhow::anyhow!("could not fetch tokenizer.json: {}", e)),
			)
		})?;
		let (weights, source) = api
			.get("model.safetensors")
			.map(|filename| (PathBuf::from(filename), WeightSource::Safetensors))
			.or_else(|_| {
				api.get("pytorch_model.bin")
					.map(|filename| (PathBuf::from(filename), WeightSource::Pytorch))
			})
			.map_err(|e| {
				ClassifierError::new(
					ClassifierErrorKind::Io,
					Arc::new(anyhow::anyhow!("could not fetch model weights: {}", e)),
				)
			})?;
		Ok((PathBuf::from(config), PathBuf::from(tokenizer), weights, source))
	}
}

fn tensor_error(e: candle_core::Error) -> ClassifierError {
	ClassifierError::new(ClassifierErrorKind::ModelError, Arc::new(e.into()))
}

/// A ready-to-call multi-label classifier: tokenizer plus fine-tuned head.
pub struct BertMultiLabelClassifier {
	head: BertForMultiLabelSequenceClassification,
	tokenizer: Tokenizer,
	device: Device,
}

impl BertMultiLabelClassifier {
	pub fn new(options: ClassifierOptions) -> ClassifierResult<Self> {
		let device = match Device::cuda_if_available(0) {
			Ok(device) => device,
			Err(error) => {
				tracing::warn!(
					"could not initialize CUDA device for the classifier, defaulting to CPU: {}",
					error
				);
				Device::Cpu
			},
		};

		let (config_filename, tokenizer_filename, weights_filename, weight_source) =
			resolve_model_files(&options)?;

		let config = std::fs::read_to_string(&config_filename)
			.map_err(|inner| ClassifierError::from(inner).add_context("could not read config.json"))?;
		let bert_config: BertConfig = serde_json::from_str(&config)
			.map_err(|inner| ClassifierError::from(inner).add_context("could not parse config.json"))?;
		let classifier_config: ClassifierConfig = serde_json::from_str(&config)
			.map_err(|inner| ClassifierError::from(inner).add_context("could not parse config.json"))?;
		let mut tokenizer = Tokenizer::from_file(&tokenizer_filename).map_err(|inner| {
			ClassifierError::new(
				ClassifierErrorKind::Tokenizer,
				Arc::new(anyhow::anyhow!("could not read tokenizer.json: {}", inner)),
			)
		})?;

		let vb = match weight_source {
			WeightSource::Pytorch => VarBuilder::from_pth(&weights_filename, DTYPE, &device)
				.map_err(|e| {
					ClassifierError::new(
						ClassifierErrorKind::PyTorch,
						Arc::new(anyhow::anyhow!("could not load PyTorch weights: {}", e)),
					)
				})?,
			WeightSource::Safetensors => unsafe {
				VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device).map_err(
					|e| {
						ClassifierError::new(
							ClassifierErrorKind::SafeTensors,
							Arc::new(anyhow::anyhow!("could not load SafeTensors weights: {}", e)),
						)
					},
				)?
			},
		};

		let head =
			BertForMultiLabelSequenceClassification::load(vb, &bert_config, &classifier_config)
				.map_err(|e| {
					ClassifierError::new(
						ClassifierErrorKind::ModelError,
						Arc::new(anyhow::anyhow!("could not load classification head: {}", e)),
					)
				})?;

		if let Some(pp) = tokenizer.get_padding_mut() {
			pp.strategy = tokenizers::PaddingStrategy::BatchLongest
		} else {
			let pp = PaddingParams {
				strategy: tokenizers::PaddingStrategy::BatchLongest,
				..Default::default()
			};
			tokenizer.with_padding(Some(pp));
		}

		Ok(Self { head, tokenizer, device })
	}

	/// Tokenize a batch of texts into padded `(input_ids, token_type_ids,
	/// attention_mask)` tensors.
	pub fn encode_batch(&self, texts: &[&str]) -> ClassifierResult<(Tensor, Tensor, Tensor)> {
		let encodings = self.tokenizer.encode_batch(texts.to_vec(), true).map_err(|e| {
			ClassifierError::new(
				ClassifierErrorKind::Tokenizer,
				Arc::new(anyhow::anyhow!("batch encoding failed: {}", e)),
			)
		})?;

		let mut input_ids = Vec::with_capacity(encodings.len());
		let mut token_type_ids = Vec::with_capacity(encodings.len());
		let mut attention_masks = Vec::with_capacity(encodings.len());
		for encoding in &encodings {
			input_ids.push(Tensor::new(encoding.get_ids(), &self.device).map_err(tensor_error)?);
			token_type_ids
				.push(Tensor::new(encoding.get_type_ids(), &self.device).map_err(tensor_error)?);
			attention_masks.push(
				Tensor::new(encoding.get_attention_mask(), &self.device).map_err(tensor_error)?,
			);
		}
		let input_ids = Tensor::stack(&input_ids, 0).map_err(tensor_error)?;
		let token_type_ids = Tensor::stack(&token_type_ids, 0).map_err(tensor_error)?;
		let attention_mask = Tensor::stack(&attention_masks, 0).map_err(tensor_error)?;

		Ok((input_ids, token_type_ids, attention_mask))
	}

	/// Score texts and return raw per-class logits.
	pub fn classify(&self, texts: &[&str]) -> ClassifierResult<SequenceClassifierOutput> {
		let (input_ids, token_type_ids, attention_mask) = self.encode_batch(texts)?;
		self.head
			.forward(&input_ids, &token_type_ids, Some(&attention_mask))
			.map_err(tensor_error)
	}

	/// Label names clearing `threshold`, one set per text.
	pub fn predict(&self, texts: &[&str], threshold: f32) -> ClassifierResult<Vec<Vec<String>>> {
		let output = self.classify(texts)?;
		self.head.predict_labels(&output.logits, threshold).map_err(tensor_error)
	}

	/// The underlying classification head.
	pub fn head(&self) -> &BertForMultiLabelSequenceClassification {
		&self.head
	}

	/// Get the device this model is running on.
	pub fn device(&self) -> &Device {
		&self.device
	}
}

impl std::fmt::Debug for BertMultiLabelClassifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BertMultiLabelClassifier")
			.field("device", &self.device)
			.field("num_labels", &self.head.num_labels())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn options_for(dir: &std::path::Path) -> ClassifierOptions {
		ClassifierOptions {
			local_dir: Some(dir.to_string_lossy().to_string()),
			..ClassifierOptions::new("unused")
		}
	}

	#[test]
	fn local_resolution_prefers_safetensors() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
		std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();
		std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();
		std::fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();

		let (_, _, weights, source) = resolve_model_files(&options_for(dir.path())).unwrap();
		assert_eq!(source, WeightSource::Safetensors);
		assert!(weights.ends_with("model.safetensors"));
	}

	#[test]
	fn local_resolution_falls_back_to_pytorch_weights() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
		std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();
		std::fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();

		let (_, _, weights, source) = resolve_model_files(&options_for(dir.path())).unwrap();
		assert_eq!(source, WeightSource::Pytorch);
		assert!(weights.ends_with("pytorch_model.bin"));
	}

	#[test]
	fn missing_weights_are_reported_as_not_found() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("config.json"), b"{}").unwrap();
		std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();

		let err = resolve_model_files(&options_for(dir.path())).unwrap_err();
		assert_eq!(err.kind(), ClassifierErrorKind::NotFound);
	}

	#[test]
	fn missing_config_is_reported_as_not_found() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();
		std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

		let err = BertMultiLabelClassifier::new(options_for(dir.path())).unwrap_err();
		assert_eq!(err.kind(), ClassifierErrorKind::NotFound);
		assert!(format!("{:?}", err).contains("could not read config.json"));
	}

	#[test]
	fn malformed_config_is_reported_as_io() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("config.json"), b"not json").unwrap();
		std::fs::write(dir.path().join("tokenizer.json"), b"{}").unwrap();
		std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();

		let err = BertMultiLabelClassifier::new(options_for(dir.path())).unwrap_err();
		assert_eq!(err.kind(), ClassifierErrorKind::Io);
		assert!(format!("{:?}", err).contains("could not parse config.json"));
	}
}
