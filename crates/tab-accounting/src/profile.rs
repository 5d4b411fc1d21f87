//! Emission multipliers derived from what a resource is showing.
//!
//! Factors are grams per minute relative to plain browsing. They are inputs to
//! the accounting, not a physical model.

use serde::{Deserialize, Serialize};

/// Plain browsing, grams CO2 per minute.
const BASE_BROWSING: f64 = 0.2;
const VIDEO_480P: f64 = 0.3;
const VIDEO_720P: f64 = 0.5;
const VIDEO_1080P: f64 = 0.7;
const VIDEO_4K: f64 = 1.2;

const YOUTUBE_MULTIPLIER: f64 = 1.2;
const NETFLIX_MULTIPLIER: f64 = 1.3;

/// Streaming resolution reported for a video resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoResolution {
    Sd,
    Hd,
    FullHd,
    Uhd,
}

impl VideoResolution {
    /// Parse labels like `720p`, `hd`, `4k`. Unknown labels are `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "480p" | "sd" => Some(Self::Sd),
            "720p" | "hd" => Some(Self::Hd),
            "1080p" | "fullhd" => Some(Self::FullHd),
            "2160p" | "4k" => Some(Self::Uhd),
            _ => None,
        }
    }

    fn factor(self) -> f64 {
        match self {
            Self::Sd => VIDEO_480P,
            Self::Hd => VIDEO_720P,
            Self::FullHd => VIDEO_1080P,
            Self::Uhd => VIDEO_4K,
        }
    }
}

/// What a tracked resource is displaying.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmissionProfile {
    pub domain: Option<String>,
    pub resolution: Option<VideoResolution>,
}

impl EmissionProfile {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            resolution: None,
        }
    }

    pub fn with_resolution(mut self, resolution: VideoResolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    /// Multiplier applied to the engine's base rate.
    ///
    /// Plain browsing is 1.0. Streaming sites use the video factor for the
    /// reported resolution (HD when unknown) times the site's multiplier.
    pub fn multiplier(&self) -> f64 {
        let site = self.domain.as_deref().and_then(|domain| {
            if domain.contains("youtube.com") {
                Some(YOUTUBE_MULTIPLIER)
            } else if domain.contains("netflix.com") {
                Some(NETFLIX_MULTIPLIER)
            } else {
                None
            }
        });

        match site {
            Some(site) => {
                let video = self.resolution.unwrap_or(VideoResolution::Hd).factor();
                video * site / BASE_BROWSING
            }
            None => 1.0,
        }
    }
}

/// Human-readable grams, switching to kilograms at 1000 g.
pub fn format_emissions(grams: f64) -> String {
    if grams >= 1000.0 {
        format!("{:.2} kg CO₂", grams / 1000.0)
    } else {
        format!("{} g CO₂", grams.round())
    }
}
