//! Quality score policy
//!
//! The score is `100 - penalty(latency) - penalty(jitter) - penalty(loss%)`,
//! clamped to 0..=100. Each penalty is a step function over
//! `[threshold, penalty]` pairs: a value at or above a threshold incurs that
//! step's penalty, and the largest applicable penalty wins. The thresholds are
//! tunable policy and come from the `[quality]` config section.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPolicy {
    /// Latency thresholds in milliseconds
    #[serde(default = "default_latency_steps")]
    pub latency_steps: Vec<[f64; 2]>,
    /// Jitter thresholds in milliseconds
    #[serde(default = "default_jitter_steps")]
    pub jitter_steps: Vec<[f64; 2]>,
    /// Packet loss thresholds in percent
    #[serde(default = "default_loss_steps")]
    pub loss_steps: Vec<[f64; 2]>,
}

fn default_latency_steps() -> Vec<[f64; 2]> {
    vec![[20.0, 5.0], [50.0, 10.0], [100.0, 20.0], [150.0, 30.0], [200.0, 40.0]]
}

fn default_jitter_steps() -> Vec<[f64; 2]> {
    vec![[5.0, 5.0], [15.0, 10.0], [30.0, 20.0], [50.0, 30.0]]
}

fn default_loss_steps() -> Vec<[f64; 2]> {
    vec![[0.5, 5.0], [1.0, 10.0], [2.5, 20.0], [5.0, 30.0], [10.0, 40.0]]
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            latency_steps: default_latency_steps(),
            jitter_steps: default_jitter_steps(),
            loss_steps: default_loss_steps(),
        }
    }
}

fn step_penalty(steps: &[[f64; 2]], value: f64) -> f64 {
    steps
        .iter()
        .filter(|[threshold, _]| value >= *threshold)
        .map(|[_, penalty]| *penalty)
        .fold(0.0, f64::max)
}

impl QualityPolicy {
    /// Sort every step table by threshold
    pub fn normalize(&mut self) {
        for steps in [
            &mut self.latency_steps,
            &mut self.jitter_steps,
            &mut self.loss_steps,
        ] {
            steps.sort_by(|a, b| a[0].total_cmp(&b[0]));
        }
    }

    pub fn latency_penalty(&self, latency_ms: f64) -> f64 {
        step_penalty(&self.latency_steps, latency_ms)
    }

    pub fn jitter_penalty(&self, jitter_ms: f64) -> f64 {
        step_penalty(&self.jitter_steps, jitter_ms)
    }

    pub fn loss_penalty(&self, loss_percent: f64) -> f64 {
        step_penalty(&self.loss_steps, loss_percent)
    }

    pub fn score(&self, latency_ms: f64, jitter_ms: f64, loss_percent: f64) -> f64 {
        let score = 100.0
            - self.latency_penalty(latency_ms)
            - self.jitter_penalty(jitter_ms)
            - self.loss_penalty(loss_percent);
        score.clamp(0.0, 100.0)
    }
}
