// Copyright 2025 Assistance Micro Design
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Token Pricing Module
//!
//! Cost calculation based on token counts and per-model pricing.
//!
//! LLM providers typically charge per million tokens (MTok) with different
//! rates for input (prompt) and output (completion) tokens. Local models
//! price at zero.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// (input, output) price in USD per million tokens.
pub type PricePerMtok = (f64, f64);

/// Reference prices for the models the default routing table uses.
///
/// Prices are subject to change; unknown models fall back to zero cost so a
/// missing table entry never inflates a session's reported spend.
static MODEL_PRICES: Lazy<HashMap<&'static str, PricePerMtok>> = Lazy::new(|| {
    HashMap::from([
        ("mistral-large-latest", (2.0, 6.0)),
        ("mistral-small-latest", (0.2, 0.6)),
        ("codestral-latest", (0.2, 0.6)),
        ("mistral-embed", (0.1, 0.0)),
        // Local and demo models are free
        ("demo", (0.0, 0.0)),
    ])
});

/// Calculates the cost based on token counts and pricing per million tokens.
///
/// # Arguments
///
/// * `tokens_input` - Number of input (prompt) tokens
/// * `tokens_output` - Number of output (completion) tokens
/// * `input_price_per_mtok` - Price in USD per million input tokens
/// * `output_price_per_mtok` - Price in USD per million output tokens
///
/// # Returns
///
/// Total cost in USD, rounded to 6 decimal places for precision
pub fn calculate_cost(
    tokens_input: u64,
    tokens_output: u64,
    input_price_per_mtok: f64,
    output_price_per_mtok: f64,
) -> f64 {
    let input_cost = (tokens_input as f64 / 1_000_000.0) * input_price_per_mtok;
    let output_cost = (tokens_output as f64 / 1_000_000.0) * output_price_per_mtok;

    // Round to 6 decimal places to avoid floating point precision noise
    let total = input_cost + output_cost;
    (total * 1_000_000.0).round() / 1_000_000.0
}

/// Looks up the reference price for a model; zero for unknown models.
pub fn price_for_model(model: &str) -> PricePerMtok {
    MODEL_PRICES.get(model).copied().unwrap_or((0.0, 0.0))
}

/// Cost for a call against the reference price table.
pub fn cost_for_call(model: &str, tokens_input: u64, tokens_output: u64) -> f64 {
    let (input_price, output_price) = price_for_model(model);
    calculate_cost(tokens_input, tokens_output, input_price, output_price)
}
