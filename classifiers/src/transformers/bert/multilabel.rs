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

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use std::collections::HashMap;

use crate::transformers::{
	loss::binary_cross_entropy_with_logit, modelling_outputs::SequenceClassifierOutput,
};

/// Classification-head fields of a BERT `config.json`.
///
/// Parsed from the same JSON document as the encoder configuration. Candle's
/// `bert::Config` keeps most of its fields private, so the head reads the ones
/// it needs on its own.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassifierConfig {
	pub hidden_size: usize,
	hidden_dropout_prob: f64,
	pub classifier_dropout: Option<f64>,
	pub _num_labels: Option<usize>,
	pub id2label: Option<HashMap<String, String>>,
	pub label2id: Option<HashMap<String, usize>>,
}

impl Default for ClassifierConfig {
	fn default() -> Self {
		Self {
			hidden_size: 768,
			hidden_dropout_prob: 0.1,
			classifier_dropout: None,
			_num_labels: None,
			id2label: None,
			label2id: None,
		}
	}
}

impl ClassifierConfig {
	/// Number of label classes, fixed for the lifetime of the head.
	pub fn num_labels(&self) -> Result<usize> {
		let num_labels = if let Some(num_labels) = self._num_labels {
			num_labels
		} else if let Some(id2label) = &self.id2label {
			id2label.len()
		} else {
			candle_core::bail!("cannot find the number of classes to map to")
		};
		if num_labels == 0 {
			candle_core::bail!("the configuration declares zero label classes")
		}
		Ok(num_labels)
	}

	/// Dropout probability applied to the pooled vector, in `[0, 1)`.
	pub fn classifier_dropout(&self) -> Result<f64> {
		let pr = self.classifier_dropout.unwrap_or(self.hidden_dropout_prob);
		if !(0.0..1.0).contains(&pr) {
			candle_core::bail!("classifier dropout probability {pr} is outside [0, 1)")
		}
		Ok(pr)
	}

	/// Label name for a class index, when the configuration carries a mapping.
	pub fn label_name(&self, index: usize) -> Option<String> {
		self.id2label.as_ref().and_then(|map| map.get(&index.to_string()).cloned())
	}
}

/// BERT with a multi-label sequence classification head.
///
/// Every input may carry any subset of the configured label set, so each class
/// gets an independent sigmoid rather than a softmax across classes. The
/// returned logits are unnormalized; callers wanting probabilities apply a
/// sigmoid per class.
pub struct BertForMultiLabelSequenceClassification {
	bert: BertModel,
	pooler: Linear,
	dropout: Dropout,
	classifier: Linear,
	num_labels: usize,
	pub config: ClassifierConfig,
	pub device: Device,
	span: tracing::Span,
}

impl BertForMultiLabelSequenceClassification {
	/// Build the encoder, its pooler, and the classification head from one
	/// weight archive.
	///
	/// The classifier weights live under the `classifier` group, the only group
	/// this head adds on top of the encoder's own. When the `VarBuilder` is
	/// backed by a fresh `VarMap` instead of an archive, the classifier weight
	/// is drawn from N(0, 0.02) and its bias set to zero.
	pub fn load(
		vb: VarBuilder,
		config: &BertConfig,
		classifier_config: &ClassifierConfig,
	) -> Result<Self> {
		let num_labels = classifier_config.num_labels()?;
		let classifier_dropout = classifier_config.classifier_dropout()?;
		let hidden_size = classifier_config.hidden_size;

		let bert = BertModel::load(vb.pp("bert"), config)?;
		let pooler =
			candle_nn::linear(hidden_size, hidden_size, vb.pp("bert").pp("pooler").pp("dense"))?;
		let classifier = {
			let vb = vb.pp("classifier");
			let weight = vb.get_with_hints(
				(num_labels, hidden_size),
				"weight",
				candle_nn::init::Init::Randn { mean: 0., stdev: 0.02 },
			)?;
			let bias = vb.get_with_hints(num_labels, "bias", candle_nn::init::Init::Const(0.))?;
			Linear::new(weight, Some(bias))
		};

		Ok(Self {
			bert,
			pooler,
			dropout: Dropout::new(classifier_dropout as f32),
			classifier,
			num_labels,
			config: classifier_config.clone(),
			device: vb.device().clone(),
			span: tracing::span!(tracing::Level::TRACE, "multi-label-head"),
		})
	}

	/// Number of label classes this head scores.
	pub fn num_labels(&self) -> usize {
		self.num_labels
	}

	fn forward_inner(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: Option<&Tensor>,
		train: bool,
	) -> Result<Tensor> {
		let _enter = self.span.enter();
		let sequence_output = self.bert.forward(input_ids, token_type_ids, attention_mask)?;
		// The pooled vector is the encoder's fixed aggregation of the
		// first-position embedding: dense then tanh.
		let cls_embedding = sequence_output.i((.., 0))?;
		let pooled_output = self.pooler.forward(&cls_embedding)?.tanh()?;
		let pooled_output = self.dropout.forward(&pooled_output, train)?;
		self.classifier.forward(&pooled_output)
	}

	/// Evaluation-mode scoring: per-class logits, no loss, dropout disabled.
	pub fn forward(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: Option<&Tensor>,
	) -> Result<SequenceClassifierOutput> {
		let logits = self.forward_inner(input_ids, token_type_ids, attention_mask, false)?;
		Ok(SequenceClassifierOutput { loss: None, logits, hidden_states: None, attentions: None })
	}

	/// Training-mode pass: stochastic dropout plus binary cross entropy against
	/// a multi-hot label matrix of width `num_labels`.
	pub fn forward_with_labels(
		&self,
		input_ids: &Tensor,
		token_type_ids: &Tensor,
		attention_mask: Option<&Tensor>,
		labels: &Tensor,
	) -> Result<SequenceClassifierOutput> {
		let logits = self.forward_inner(input_ids, token_type_ids, attention_mask, true)?;

		let label_width = labels.dim(D::Minus1)?;
		if label_width != self.num_labels {
			candle_core::bail!(
				"label width {label_width} does not match the configured {} label classes",
				self.num_labels
			)
		}
		let labels = labels.to_device(logits.device())?.to_dtype(DType::F32)?;
		// A single unbatched example arrives as rank 1; restore the batch
		// dimension on both sides before the loss reduction.
		let flat_logits = logits.reshape(((), self.num_labels))?;
		let flat_labels = labels.reshape(((), self.num_labels))?;
		let loss = binary_cross_entropy_with_logit(&flat_logits, &flat_labels)?;

		Ok(SequenceClassifierOutput {
			loss: Some(loss),
			logits,
			hidden_states: None,
			attentions: None,
		})
	}

	/// Independent per-class probabilities for raw logits.
	pub fn probabilities(&self, logits: &Tensor) -> Result<Tensor> {
		candle_nn::ops::sigmoid(logits)
	}

	/// Label names whose probability clears `threshold`, one set per example.
	///
	/// Classes without an `id2label` entry fall back to their index.
	pub fn predict_labels(&self, logits: &Tensor, threshold: f32) -> Result<Vec<Vec<String>>> {
		let probabilities = self.probabilities(logits)?;
		let probabilities = probabilities.reshape(((), self.num_labels))?.to_vec2::<f32>()?;

		let mut predictions = Vec::with_capacity(probabilities.len());
		for row in probabilities {
			let mut active = Vec::new();
			for (index, &probability) in row.iter().enumerate() {
				if probability > threshold {
					let name =
						self.config.label_name(index).unwrap_or_else(|| index.to_string());
					active.push(name);
				}
			}
			predictions.push(active);
		}
		Ok(predictions)
	}
}

impl std::fmt::Debug for BertForMultiLabelSequenceClassification {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BertForMultiLabelSequenceClassification")
			.field("device", &self.device)
			.field("num_labels", &self.num_labels)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use candle_core::{DType, Device, Tensor};
	use candle_nn::{VarBuilder, VarMap};

	const TINY_CONFIG: &str = r#"{
		"vocab_size": 128,
		"hidden_size": 32,
		"num_hidden_layers": 2,
		"num_attention_heads": 4,
		"intermediate_size": 64,
		"hidden_act": "gelu",
		"hidden_dropout_prob": 0.1,
		"max_position_embeddings": 64,
		"type_vocab_size": 2,
		"initializer_range": 0.02,
		"layer_norm_eps": 1e-12,
		"pad_token_id": 0,
		"classifier_dropout": 0.0,
		"_num_labels": 6,
		"id2label": {
			"0": "toxic",
			"1": "severe_toxic",
			"2": "obscene",
			"3": "threat",
			"4": "insult",
			"5": "identity_hate"
		}
	}"#;

	fn tiny_head(device: &Device) -> BertForMultiLabelSequenceClassification {
		let config: BertConfig = serde_json::from_str(TINY_CONFIG).unwrap();
		let classifier_config: ClassifierConfig = serde_json::from_str(TINY_CONFIG).unwrap();
		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
		BertForMultiLabelSequenceClassification::load(vb, &config, &classifier_config).unwrap()
	}

	fn tiny_batch(device: &Device, batch_size: usize) -> (Tensor, Tensor) {
		let seq_len = 5usize;
		let ids: Vec<u32> = (0..batch_size * seq_len).map(|i| (i % 100) as u32 + 1).collect();
		let input_ids = Tensor::from_vec(ids, (batch_size, seq_len), device).unwrap();
		let token_type_ids = input_ids.zeros_like().unwrap();
		(input_ids, token_type_ids)
	}

	#[test]
	fn eval_forward_returns_logits_without_loss() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let (input_ids, token_type_ids) = tiny_batch(&device, 3);

		let output = head.forward(&input_ids, &token_type_ids, None).unwrap();
		assert!(output.loss.is_none());
		assert_eq!(output.logits.dims(), &[3, 6]);
		assert!(output.hidden_states.is_none());
		assert!(output.attentions.is_none());
	}

	#[test]
	fn eval_forward_is_deterministic_and_idempotent() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let (input_ids, token_type_ids) = tiny_batch(&device, 2);

		let first = head
			.forward(&input_ids, &token_type_ids, None)
			.unwrap()
			.logits
			.to_vec2::<f32>()
			.unwrap();
		let second = head
			.forward(&input_ids, &token_type_ids, None)
			.unwrap()
			.logits
			.to_vec2::<f32>()
			.unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn labelled_forward_returns_scalar_loss_and_logits() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let (input_ids, token_type_ids) = tiny_batch(&device, 1);
		let labels =
			Tensor::from_vec(vec![1f32, 0., 0., 1., 0., 0.], (1, 6), &device).unwrap();

		let output =
			head.forward_with_labels(&input_ids, &token_type_ids, None, &labels).unwrap();
		let loss = output.loss.expect("labelled path must produce a loss");
		assert!(loss.dims().is_empty());
		assert!(loss.to_scalar::<f32>().unwrap() >= 0.0);
		assert_eq!(output.logits.dims(), &[1, 6]);
	}

	#[test]
	fn unbatched_labels_gain_their_batch_dimension() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let (input_ids, token_type_ids) = tiny_batch(&device, 1);
		let labels = Tensor::from_vec(vec![0f32, 1., 0., 0., 1., 0.], 6, &device).unwrap();

		let output =
			head.forward_with_labels(&input_ids, &token_type_ids, None, &labels).unwrap();
		assert!(output.loss.unwrap().dims().is_empty());
	}

	#[test]
	fn mismatched_label_width_is_rejected() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let (input_ids, token_type_ids) = tiny_batch(&device, 1);
		let labels = Tensor::from_vec(vec![1f32, 0., 0., 1., 0.], (1, 5), &device).unwrap();

		let result = head.forward_with_labels(&input_ids, &token_type_ids, None, &labels);
		assert!(result.is_err());
	}

	#[test]
	fn all_ones_attention_mask_matches_maskless_logits() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let (input_ids, token_type_ids) = tiny_batch(&device, 2);
		let attention_mask = input_ids.ones_like().unwrap();

		let unmasked = head
			.forward(&input_ids, &token_type_ids, None)
			.unwrap()
			.logits
			.to_vec2::<f32>()
			.unwrap();
		let masked = head
			.forward(&input_ids, &token_type_ids, Some(&attention_mask))
			.unwrap()
			.logits
			.to_vec2::<f32>()
			.unwrap();
		for (row_a, row_b) in unmasked.iter().zip(masked.iter()) {
			for (a, b) in row_a.iter().zip(row_b.iter()) {
				assert!((a - b).abs() < 1e-5);
			}
		}
	}

	#[test]
	fn predict_labels_maps_indices_through_id2label() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let logits =
			Tensor::from_vec(vec![6f32, -6., -6., 6., -6., -6.], (1, 6), &device).unwrap();

		let predictions = head.predict_labels(&logits, 0.5).unwrap();
		assert_eq!(predictions, vec![vec!["toxic".to_string(), "threat".to_string()]]);
	}

	#[test]
	fn num_labels_falls_back_to_id2label() {
		let mut config: ClassifierConfig = serde_json::from_str(TINY_CONFIG).unwrap();
		config._num_labels = None;
		assert_eq!(config.num_labels().unwrap(), 6);

		config.id2label = None;
		assert!(config.num_labels().is_err());
	}

	#[test]
	fn out_of_range_dropout_is_rejected_at_construction() {
		let device = Device::Cpu;
		let config: BertConfig = serde_json::from_str(TINY_CONFIG).unwrap();
		let mut classifier_config: ClassifierConfig = serde_json::from_str(TINY_CONFIG).unwrap();
		classifier_config.classifier_dropout = Some(-0.1);

		let varmap = VarMap::new();
		let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
		let result =
			BertForMultiLabelSequenceClassification::load(vb, &config, &classifier_config);
		assert!(result.is_err());
	}

	#[test]
	fn probabilities_are_sigmoid_of_logits() {
		let device = Device::Cpu;
		let head = tiny_head(&device);
		let logits = Tensor::from_vec(vec![0f32, 2., -2.], (1, 3), &device).unwrap();

		let probabilities =
			head.probabilities(&logits).unwrap().to_vec2::<f32>().unwrap();
		assert!((probabilities[0][0] - 0.5).abs() < 1e-6);
		assert!(probabilities[0][1] > 0.85);
		assert!(probabilities[0][2] < 0.15);
	}
}
