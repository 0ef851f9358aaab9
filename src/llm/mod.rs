// Copyright 2025 Zileo-Chat-3 Contributors
// SPDX-License-Identifier: Apache-2.0

//! LLM gateway layer.
//!
//! The core never talks to a model API directly; everything goes through the
//! [`Gateway`] trait so providers stay swappable and tests can script
//! responses.

pub mod demo;
pub mod gateway;
pub mod openai;
pub mod pricing;
pub mod retry;

pub use demo::DemoGateway;
pub use gateway::{
    estimate_tokens, ChatConfig, ChatMessage, ChatResponse, Gateway, GatewayError, MessageRole,
    StreamDelta,
};
pub use openai::OpenAiGateway;
pub use retry::{with_retry, RetryConfig};
