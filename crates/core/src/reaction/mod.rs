use serde::{Deserialize, Serialize};

use crate::{analysis::FrameWindow, config::ReactionConfig, engine::PlaybackEngine};

/// Anything that can answer amplitude and band-energy queries.
pub trait AnalysisSource {
    /// Mean absolute sample value, in `[0, 1]`.
    fn instantaneous_amplitude(&self) -> f32;

    /// Mean spectral magnitude within `[min_hz, max_hz]`.
    fn band_average(&self, min_hz: f32, max_hz: f32) -> f32;
}

impl AnalysisSource for FrameWindow {
    fn instantaneous_amplitude(&self) -> f32 {
        FrameWindow::instantaneous_amplitude(self)
    }

    fn band_average(&self, min_hz: f32, max_hz: f32) -> f32 {
        FrameWindow::band_average(self, min_hz, max_hz)
    }
}

impl AnalysisSource for PlaybackEngine {
    fn instantaneous_amplitude(&self) -> f32 {
        PlaybackEngine::instantaneous_amplitude(self)
    }

    fn band_average(&self, min_hz: f32, max_hz: f32) -> f32 {
        PlaybackEngine::band_average(self, min_hz, max_hz)
    }
}

/// Which reading drives a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReactionKind {
    Amplitude,
    Frequency { min_hz: f32, max_hz: f32 },
}

/// Shape property a reaction writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionTarget {
    Size,
    Width,
    Height,
    ColorRed,
    ColorGreen,
    ColorBlue,
}

impl ReactionTarget {
    /// Red, green or blue channel.
    pub fn is_color(self) -> bool {
        matches!(
            self,
            ReactionTarget::ColorRed | ReactionTarget::ColorGreen | ReactionTarget::ColorBlue
        )
    }

    /// Colour channels wrap at 255.
    fn normalise(self, value: f64) -> f64 {
        if self.is_color() {
            value % 255.0
        } else {
            value
        }
    }
}

/// Normalisation of band energy into a `[0, 1]` factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPolicy {
    /// Band energy at or above this maps to a factor of 1.
    pub ceiling: f64,
}

impl FrequencyPolicy {
    /// Band energy clamped to `[0, ceiling]` and scaled to `[0, 1]`. A
    /// non-positive ceiling yields 0.
    pub fn factor(&self, band_average: f32) -> f64 {
        if self.ceiling.is_nan() || self.ceiling <= 0.0 {
            return 0.0;
        }
        f64::from(band_average).clamp(0.0, self.ceiling) / self.ceiling
    }
}

impl Default for FrequencyPolicy {
    fn default() -> Self {
        Self::from(&ReactionConfig::default())
    }
}

impl From<&ReactionConfig> for FrequencyPolicy {
    fn from(config: &ReactionConfig) -> Self {
        Self {
            ceiling: config.frequency_ceiling,
        }
    }
}

/// Maps one analysis reading linearly onto `[min_value, max_value]` of a
/// shape property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ReactionFields")]
pub struct Reaction {
    kind: ReactionKind,
    target: ReactionTarget,
    min_value: f64,
    max_value: f64,
}

#[derive(Deserialize)]
struct ReactionFields {
    kind: ReactionKind,
    target: ReactionTarget,
    min_value: f64,
    max_value: f64,
}

impl From<ReactionFields> for Reaction {
    fn from(fields: ReactionFields) -> Self {
        Reaction::new(fields.kind, fields.target, fields.min_value, fields.max_value)
    }
}

impl Reaction {
    /// Colour targets wrap both ends of the range at 255.
    pub fn new(kind: ReactionKind, target: ReactionTarget, min_value: f64, max_value: f64) -> Self {
        Self {
            kind,
            target,
            min_value: target.normalise(min_value),
            max_value: target.normalise(max_value),
        }
    }

    /// A reaction driven by the instantaneous amplitude.
    pub fn amplitude(target: ReactionTarget, min_value: f64, max_value: f64) -> Self {
        Self::new(ReactionKind::Amplitude, target, min_value, max_value)
    }

    /// A reaction driven by the band energy between `min_hz` and `max_hz`.
    pub fn frequency(
        min_hz: f32,
        max_hz: f32,
        target: ReactionTarget,
        min_value: f64,
        max_value: f64,
    ) -> Self {
        Self::new(
            ReactionKind::Frequency { min_hz, max_hz },
            target,
            min_value,
            max_value,
        )
    }

    pub fn kind(&self) -> ReactionKind {
        self.kind
    }

    pub fn target(&self) -> ReactionTarget {
        self.target
    }

    pub fn min_value(&self) -> f64 {
        self.min_value
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    pub fn set_kind(&mut self, kind: ReactionKind) {
        self.kind = kind;
    }

    /// Changing the target does not re-normalise the stored range.
    pub fn set_target(&mut self, target: ReactionTarget) {
        self.target = target;
    }

    pub fn set_min_value(&mut self, value: f64) {
        self.min_value = self.target.normalise(value);
    }

    pub fn set_max_value(&mut self, value: f64) {
        self.max_value = self.target.normalise(value);
    }

    /// Reading normalised to `[0, 1]`.
    pub fn factor(&self, source: &impl AnalysisSource, policy: &FrequencyPolicy) -> f64 {
        match self.kind {
            ReactionKind::Amplitude => f64::from(source.instantaneous_amplitude()),
            ReactionKind::Frequency { min_hz, max_hz } => {
                policy.factor(source.band_average(min_hz, max_hz))
            }
        }
    }

    /// Value for the target, interpolated between the range bounds.
    pub fn value(&self, source: &impl AnalysisSource, policy: &FrequencyPolicy) -> f64 {
        let factor = self.factor(source, policy);
        self.min_value + factor * (self.max_value - self.min_value)
    }
}

/// Concrete value routed to a shape parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    pub target: ReactionTarget,
    pub value: f64,
}

/// The reactions attached to one shape, evaluated together each tick.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ReactionSet {
    #[serde(default)]
    policy: FrequencyPolicy,
    reactions: Vec<Reaction>,
    #[serde(skip)]
    updates: Vec<ParameterUpdate>,
}

impl ReactionSet {
    /// An empty set normalising band energy with `policy`.
    pub fn new(policy: FrequencyPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> &FrequencyPolicy {
        &self.policy
    }

    pub fn reactions(&self) -> &[Reaction] {
        &self.reactions
    }

    pub fn reactions_mut(&mut self) -> &mut Vec<Reaction> {
        &mut self.reactions
    }

    pub fn push(&mut self, reaction: Reaction) {
        self.reactions.push(reaction);
    }

    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    /// Updates from the last [`evaluate`](Self::evaluate).
    pub fn updates(&self) -> &[ParameterUpdate] {
        &self.updates
    }

    /// Evaluates every reaction against `source`, in insertion order.
    pub fn evaluate(&mut self, source: &impl AnalysisSource) -> &[ParameterUpdate] {
        self.updates.clear();
        for reaction in &self.reactions {
            self.updates.push(ParameterUpdate {
                target: reaction.target,
                value: reaction.value(source, &self.policy),
            });
        }
        &self.updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        amplitude: f32,
        band: f32,
    }

    impl AnalysisSource for Fixed {
        fn instantaneous_amplitude(&self) -> f32 {
            self.amplitude
        }

        fn band_average(&self, _min_hz: f32, _max_hz: f32) -> f32 {
            self.band
        }
    }

    #[test]
    fn amplitude_maps_linearly() {
        let reaction = Reaction::amplitude(ReactionTarget::Size, 10.0, 20.0);
        let source = Fixed {
            amplitude: 0.25,
            band: 0.0,
        };
        assert_eq!(reaction.value(&source, &FrequencyPolicy::default()), 12.5);
    }

    #[test]
    fn band_energy_is_capped_at_the_ceiling() {
        let reaction = Reaction::frequency(60.0, 250.0, ReactionTarget::Width, 0.0, 100.0);
        let policy = FrequencyPolicy::default();

        let quiet = Fixed {
            amplitude: 0.0,
            band: 35.0,
        };
        let loud = Fixed {
            amplitude: 0.0,
            band: 500.0,
        };
        assert_eq!(reaction.value(&quiet, &policy), 50.0);
        assert_eq!(reaction.value(&loud, &policy), 100.0);
        assert_eq!(
            reaction.value(&quiet, &FrequencyPolicy { ceiling: 35.0 }),
            100.0
        );
    }

    #[test]
    fn colour_ranges_wrap_at_255() {
        let mut reaction = Reaction::amplitude(ReactionTarget::ColorRed, 300.0, 255.0);
        assert_eq!(reaction.min_value(), 45.0);
        assert_eq!(reaction.max_value(), 0.0);

        reaction.set_max_value(600.0);
        assert_eq!(reaction.max_value(), 90.0);

        let size = Reaction::amplitude(ReactionTarget::Size, 300.0, 600.0);
        assert_eq!(size.max_value(), 600.0);
    }

    #[test]
    fn deserialised_reactions_are_normalised() {
        let json = r#"{"kind":{"kind":"amplitude"},"target":"color_blue","min_value":0.0,"max_value":510.0}"#;
        let reaction: Reaction = serde_json::from_str(json).unwrap();
        assert_eq!(reaction.max_value(), 0.0);
    }

    #[test]
    fn set_evaluates_in_order() {
        let mut set = ReactionSet::new(FrequencyPolicy { ceiling: 70.0 });
        set.push(Reaction::amplitude(ReactionTarget::Height, 1.0, 3.0));
        set.push(Reaction::frequency(
            20.0,
            200.0,
            ReactionTarget::ColorGreen,
            0.0,
            200.0,
        ));

        let source = Fixed {
            amplitude: 0.5,
            band: 7.0,
        };
        let updates = set.evaluate(&source).to_vec();

        assert_eq!(
            updates,
            vec![
                ParameterUpdate {
                    target: ReactionTarget::Height,
                    value: 2.0,
                },
                ParameterUpdate {
                    target: ReactionTarget::ColorGreen,
                    value: 20.0,
                },
            ]
        );
        assert_eq!(set.updates().len(), 2);
    }

    #[test]
    fn frame_window_is_an_analysis_source() {
        let mut window = FrameWindow::silent(8, 8_000);
        window.samples = vec![0.5; 8];
        let reaction = Reaction::amplitude(ReactionTarget::Size, 0.0, 2.0);
        assert_eq!(reaction.value(&window, &FrequencyPolicy::default()), 1.0);
    }
}
