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

use serde::{Deserialize, Serialize};
use std::{fmt, io, sync::Arc};
use thiserror::Error;

/// Classifier error kind.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ClassifierErrorKind {
	/// Io error.
	Io,
	/// Not found error.
	NotFound,
	/// PyTorch error.
	PyTorch,
	/// Safetensors error.
	SafeTensors,
	/// Tokenizer error.
	Tokenizer,
	/// Model error.
	ModelError,
}

/// A generic error type for classifier operations, encapsulating an error kind and its source.
#[derive(Debug, Clone, Error)]
#[error("source error(kind={kind:?}, source={source})")]
#[allow(missing_docs)]
pub struct ClassifierError {
	/// The kind of error.
	pub kind: ClassifierErrorKind,
	/// The source of the error.
	#[source]
	pub source: Arc<anyhow::Error>,
}

/// A type alias for results returned by classifier operations.
pub type ClassifierResult<T> = Result<T, ClassifierError>;

impl ClassifierError {
	/// Creates a new `ClassifierError` with the specified kind and source.
	pub fn new(kind: ClassifierErrorKind, source: Arc<anyhow::Error>) -> Self {
		ClassifierError { kind, source }
	}

	/// Adds some context to the existing error.
	pub fn add_context<C>(self, ctx: C) -> Self
	where
		C: fmt::Display + Send + Sync + 'static,
	{
		ClassifierError {
			kind: self.kind,
			source: Arc::new(anyhow::anyhow!("{ctx}").context(self.source)),
		}
	}

	/// Returns the kind of this error.
	pub fn kind(&self) -> ClassifierErrorKind {
		self.kind.clone()
	}
}

impl From<io::Error> for ClassifierError {
	fn from(err: io::Error) -> ClassifierError {
		match err.kind() {
			io::ErrorKind::NotFound =>
				ClassifierError::new(ClassifierErrorKind::NotFound, Arc::new(err.into())),
			_ => ClassifierError::new(ClassifierErrorKind::Io, Arc::new(err.into())),
		}
	}
}

impl From<serde_json::Error> for ClassifierError {
	fn from(err: serde_json::Error) -> ClassifierError {
		ClassifierError::new(ClassifierErrorKind::Io, Arc::new(err.into()))
	}
}
