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

use candle_core::{Result, Tensor};

/// Binary cross entropy over raw logits.
///
/// Every class is scored independently of the others, and the loss is averaged
/// over all (example, class) pairs into a single scalar. Targets are multi-hot
/// matrices with values in {0, 1}.
///
/// Computed per element as `max(x, 0) - x * t + ln(1 + e^-|x|)`, which equals
/// `-[t * ln(sigmoid(x)) + (1 - t) * ln(1 - sigmoid(x))]` but stays finite
/// where the sigmoid saturates in f32.
pub fn binary_cross_entropy_with_logit(inp: &Tensor, target: &Tensor) -> Result<Tensor> {
	let relu = inp.relu()?;
	let product = (inp * target)?;
	let softplus = inp.abs()?.neg()?.exp()?.affine(1., 1.)?.log()?;

	let loss = ((relu - product)? + softplus)?.mean_all()?;

	Ok(loss)
}
