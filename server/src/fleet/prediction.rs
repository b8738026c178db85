//! Peer-count trend prediction used to bias a member's reported load.
//!
//! The predictor fits a least-squares line through the most recent peer-count
//! samples and extrapolates it `horizon` samples ahead. The projected peer count
//! is bucketed into a load level with `peers_per_level` peers per level.

use shared::{LoadLevel, MAX_LOAD_LEVEL};
use std::collections::VecDeque;

use crate::config::DirectoryConfig;

#[derive(Debug, Clone)]
pub struct LoadPredictor {
    samples: VecDeque<u32>,
    window: usize,
    horizon: u32,
    peers_per_level: u32,
}

impl LoadPredictor {
    pub fn new(window: usize, horizon: u32, peers_per_level: u32) -> Self {
        let window = window.max(2);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            horizon,
            peers_per_level: peers_per_level.max(1),
        }
    }

    /// Returns a predictor when prediction is enabled in `config`.
    pub fn from_config(config: &DirectoryConfig) -> Option<Self> {
        config.prediction.then(|| {
            Self::new(
                config.prediction_window,
                config.prediction_horizon,
                config.peers_per_level,
            )
        })
    }

    /// Adds a sample and returns the predicted level.
    pub fn sample(&mut self, peer_count: u32) -> LoadLevel {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(peer_count);
        self.level_for(self.predicted_peers())
    }

    pub fn slope(&self) -> f32 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }

        let n_f = n as f32;
        let mean_x = (n_f - 1.0) / 2.0;
        let mean_y = self.samples.iter().map(|&s| s as f32).sum::<f32>() / n_f;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, &sample) in self.samples.iter().enumerate() {
            let dx = i as f32 - mean_x;
            numerator += dx * (sample as f32 - mean_y);
            denominator += dx * dx;
        }

        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }

    /// Peer count the fitted line reaches `horizon` samples past the newest one.
    pub fn predicted_peers(&self) -> f32 {
        let n = self.samples.len();
        if n == 0 {
            return 0.0;
        }

        let slope = self.slope();
        let mean_x = (n as f32 - 1.0) / 2.0;
        let mean_y = self.samples.iter().map(|&s| s as f32).sum::<f32>() / n as f32;
        let x = (n - 1) as f32 + self.horizon as f32;

        (mean_y + slope * (x - mean_x)).max(0.0)
    }

    fn level_for(&self, peers: f32) -> LoadLevel {
        let level = (peers / self.peers_per_level as f32).floor();
        LoadLevel::new(level.min(MAX_LOAD_LEVEL as f32) as u8)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_disabled_by_default() {
        assert!(LoadPredictor::from_config(&DirectoryConfig::default()).is_none());

        let config = DirectoryConfig {
            prediction: true,
            ..Default::default()
        };
        assert!(LoadPredictor::from_config(&config).is_some());
    }

    #[test]
    fn test_flat_samples_have_zero_slope() {
        let mut predictor = LoadPredictor::new(4, 2, 10);
        for _ in 0..4 {
            predictor.sample(30);
        }
        assert_approx_eq!(predictor.slope(), 0.0, 1e-4);
        assert_approx_eq!(predictor.predicted_peers(), 30.0, 1e-3);
    }

    #[test]
    fn test_rising_trend_extrapolates() {
        let mut predictor = LoadPredictor::new(4, 2, 10);
        let mut level = LoadLevel::LOWEST;
        for peers in [10, 20, 30, 40] {
            level = predictor.sample(peers);
        }

        assert_approx_eq!(predictor.slope(), 10.0, 1e-3);
        // 40 now, +10 per sample, two samples ahead.
        assert_approx_eq!(predictor.predicted_peers(), 60.0, 1e-3);
        assert_eq!(level, LoadLevel::new(6));
    }

    #[test]
    fn test_window_drops_oldest_samples() {
        let mut predictor = LoadPredictor::new(3, 0, 10);
        for peers in [100, 0, 0, 0] {
            predictor.sample(peers);
        }
        assert_eq!(predictor.len(), 3);
        assert_approx_eq!(predictor.slope(), 0.0, 1e-4);
    }

    #[test]
    fn test_falling_trend_clamps_at_zero() {
        let mut predictor = LoadPredictor::new(4, 10, 10);
        for peers in [40, 30, 20, 10] {
            predictor.sample(peers);
        }
        assert_approx_eq!(predictor.predicted_peers(), 0.0, 1e-4);
    }

    #[test]
    fn test_level_saturates() {
        let mut predictor = LoadPredictor::new(2, 0, 1);
        assert_eq!(predictor.sample(10_000), LoadLevel::HIGHEST);
    }
}
