use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::{Component, ComponentStatus, TaskParams};

/// Weighted phase of a task used for the unified percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    VideoUpload,
    SubtitlePipeline,
    SubtitleUpload,
}

impl Stage {
    pub fn weight(&self) -> u32 {
        match self {
            Stage::Download => 20,
            Stage::VideoUpload => 40,
            Stage::SubtitlePipeline => 30,
            Stage::SubtitleUpload => 10,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::VideoUpload => "video_upload",
            Stage::SubtitlePipeline => "subtitle_pipeline",
            Stage::SubtitleUpload => "subtitle_upload",
        }
    }

    /// Upload stage feeding the given component.
    pub fn upload_for(component: Component) -> Stage {
        match component {
            Component::Video => Stage::VideoUpload,
            Component::Subtitle => Stage::SubtitleUpload,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const FALLBACK_TOTAL_WEIGHT: u32 = 100;

/// Converts raw per-stage fractions into a single monotonic 0..=100 value.
#[derive(Debug, Clone)]
pub struct ProgressModel {
    active_weights: BTreeMap<Stage, u32>,
    completed: BTreeSet<Stage>,
    completed_weight: u32,
    last_fraction: BTreeMap<Stage, f64>,
    upload_subtitle: bool,
    last_total: u8,
}

impl ProgressModel {
    pub fn new(params: &TaskParams) -> Self {
        let mut active_weights = BTreeMap::new();
        if params.upload_video {
            active_weights.insert(Stage::VideoUpload, Stage::VideoUpload.weight());
        }
        if params.extract_subtitle {
            active_weights.insert(Stage::SubtitlePipeline, Stage::SubtitlePipeline.weight());
        }
        if params.uploads_subtitle() {
            active_weights.insert(Stage::SubtitleUpload, Stage::SubtitleUpload.weight());
        }
        if !active_weights.is_empty() {
            active_weights.insert(Stage::Download, Stage::Download.weight());
        }
        Self {
            active_weights,
            completed: BTreeSet::new(),
            completed_weight: 0,
            last_fraction: BTreeMap::new(),
            upload_subtitle: params.uploads_subtitle(),
            last_total: 0,
        }
    }

    pub fn is_active(&self, stage: Stage) -> bool {
        self.active_weights.contains_key(&stage)
    }

    pub fn total_weight(&self) -> u32 {
        let sum: u32 = self.active_weights.values().sum();
        if sum == 0 {
            FALLBACK_TOTAL_WEIGHT
        } else {
            sum
        }
    }

    pub fn update_stage(&mut self, stage: Stage, fraction: f64) {
        if fraction.is_nan() || fraction < 0.0 {
            return;
        }
        let fraction = fraction.min(1.0);
        let previous = self.last_fraction.get(&stage).copied().unwrap_or(0.0);
        if fraction < previous {
            return;
        }
        self.last_fraction.insert(stage, fraction);
        if fraction >= 1.0 {
            self.complete_stage(stage);
        }
    }

    pub fn mark_component_terminal(&mut self, component: Component, status: ComponentStatus) {
        if !status.is_terminal() {
            return;
        }
        match component {
            Component::Video => self.complete_stage(Stage::VideoUpload),
            Component::Subtitle => {
                self.complete_stage(Stage::SubtitlePipeline);
                if self.upload_subtitle && status != ComponentStatus::Skipped {
                    self.complete_stage(Stage::SubtitleUpload);
                }
            }
        }
    }

    /// Current percentage; never lower than any value previously returned.
    pub fn get_total(&mut self) -> u8 {
        let in_flight: f64 = self
            .active_weights
            .iter()
            .filter(|(stage, _)| !self.completed.contains(stage))
            .map(|(stage, weight)| {
                let fraction = self.last_fraction.get(stage).copied().unwrap_or(0.0);
                *weight as f64 * fraction
            })
            .sum();
        let raw = 100.0 * (self.completed_weight as f64 + in_flight) / self.total_weight() as f64;
        let rounded = raw.round().clamp(0.0, 100.0) as u8;
        self.last_total = self.last_total.max(rounded);
        self.last_total
    }

    fn complete_stage(&mut self, stage: Stage) {
        let Some(weight) = self.active_weights.get(&stage).copied() else {
            return;
        };
        if self.completed.insert(stage) {
            self.completed_weight += weight;
            self.last_fraction.insert(stage, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(upload_video: bool, extract_subtitle: bool, upload_subtitle: bool) -> TaskParams {
        TaskParams {
            url: "https://example.com/clip.mp4".into(),
            upload_video,
            extract_subtitle,
            upload_subtitle,
        }
    }

    #[test]
    fn download_inactive_when_nothing_else_requested() {
        let model = ProgressModel::new(&params(false, false, true));
        assert!(!model.is_active(Stage::Download));
        assert!(!model.is_active(Stage::SubtitleUpload));
        assert_eq!(model.total_weight(), 100);
    }

    #[test]
    fn video_only_weights_download_and_upload() {
        let mut model = ProgressModel::new(&params(true, false, false));
        assert_eq!(model.total_weight(), 60);
        model.update_stage(Stage::Download, 1.0);
        assert_eq!(model.get_total(), 33);
        model.update_stage(Stage::VideoUpload, 0.5);
        assert_eq!(model.get_total(), 67);
    }

    #[test]
    fn completed_stage_is_counted_once() {
        let mut model = ProgressModel::new(&params(true, true, true));
        model.update_stage(Stage::Download, 1.0);
        model.update_stage(Stage::Download, 1.0);
        model.update_stage(Stage::Download, 1.5);
        assert_eq!(model.get_total(), 20);
        model.mark_component_terminal(Component::Video, ComponentStatus::Success);
        model.mark_component_terminal(Component::Video, ComponentStatus::Success);
        assert_eq!(model.get_total(), 60);
    }

    #[test]
    fn stale_and_invalid_fractions_are_ignored() {
        let mut model = ProgressModel::new(&params(true, false, false));
        model.update_stage(Stage::Download, 0.8);
        let before = model.get_total();
        model.update_stage(Stage::Download, 0.2);
        model.update_stage(Stage::Download, f64::NAN);
        model.update_stage(Stage::Download, -1.0);
        assert_eq!(model.get_total(), before);
    }

    #[test]
    fn total_never_decreases() {
        let mut model = ProgressModel::new(&params(true, true, false));
        let updates = [
            (Stage::Download, 0.5),
            (Stage::SubtitlePipeline, 0.35),
            (Stage::Download, 0.3),
            (Stage::VideoUpload, 0.1),
            (Stage::Download, 1.0),
            (Stage::SubtitlePipeline, 0.2),
            (Stage::VideoUpload, 1.0),
        ];
        let mut last = 0;
        for (stage, fraction) in updates {
            model.update_stage(stage, fraction);
            let total = model.get_total();
            assert!(total >= last, "{stage} dropped total from {last} to {total}");
            last = total;
        }
    }

    #[test]
    fn every_combination_closes_at_one_hundred() {
        for mask in 0..8u8 {
            let p = params(mask & 1 != 0, mask & 2 != 0, mask & 4 != 0);
            let mut model = ProgressModel::new(&p);
            if !p.needs_download() {
                continue;
            }
            model.update_stage(Stage::Download, 1.0);
            if p.upload_video {
                model.mark_component_terminal(Component::Video, ComponentStatus::Success);
            }
            if p.extract_subtitle {
                model.mark_component_terminal(Component::Subtitle, ComponentStatus::Failed);
            }
            assert_eq!(model.get_total(), 100, "params {p:?}");
        }
    }

    #[test]
    fn skipped_subtitle_leaves_subtitle_upload_open() {
        let mut model = ProgressModel::new(&params(false, true, true));
        model.update_stage(Stage::Download, 1.0);
        model.mark_component_terminal(Component::Subtitle, ComponentStatus::Skipped);
        assert_eq!(model.get_total(), 83);
    }

    #[test]
    fn running_status_does_not_complete_stages() {
        let mut model = ProgressModel::new(&params(true, false, false));
        model.mark_component_terminal(Component::Video, ComponentStatus::Running);
        assert_eq!(model.get_total(), 0);
    }
}
