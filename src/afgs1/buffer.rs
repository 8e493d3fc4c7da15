use super::{database::MAX_PARAM_SETS, params::FilmGrainParams};

/// Emulates the buffer in which a conforming decoder retains previously
/// transmitted film grain parameter sets.
///
/// Replaying the decoder's memory lets the writer elide the body of a set
/// that was already transmitted, by sending it with `update_parameters`
/// cleared.
#[derive(Debug, Clone)]
pub struct ParamsBuffer {
    slots: [Option<FilmGrainParams>; MAX_PARAM_SETS],
    prediction_enabled: bool,
}

impl Default for ParamsBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamsBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            prediction_enabled: true,
        }
    }

    /// Like [`Self::new`], but `find` always reports a miss, so every set is
    /// retransmitted in full. A diagnostic aid for decoders that mishandle
    /// parameter reuse.
    #[must_use]
    pub fn without_prediction() -> Self {
        Self {
            prediction_enabled: false,
            ..Self::new()
        }
    }

    /// Marks every slot empty, as a decoder starting at a random access
    /// point does.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Stores `params` in its slot, overwriting. Only sets a decoder would
    /// retain are stored: those with both `apply_grain` and
    /// `update_parameters` set.
    pub fn update(&mut self, params: &FilmGrainParams) {
        if params.apply_grain && params.update_parameters {
            self.slots[usize::from(params.film_grain_param_set_idx)] = Some(params.clone());
        }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&FilmGrainParams> {
        self.slots.get(index)?.as_ref()
    }

    /// The lowest slot holding a set equal to `params`. The grain seed does
    /// not participate in the comparison, so a seed-modulated resend of a
    /// known set still hits.
    #[must_use]
    pub fn find(&self, params: &FilmGrainParams) -> Option<usize> {
        if !self.prediction_enabled {
            return None;
        }
        self.slots
            .iter()
            .position(|slot| slot.as_ref() == Some(params))
    }
}

#[cfg(test)]
mod tests {
    use super::ParamsBuffer;
    use crate::afgs1::params::sample_params;

    #[test]
    fn update_stores_only_applied_updating_sets() {
        let mut buffer = ParamsBuffer::new();

        let mut skipped = sample_params();
        skipped.apply_grain = false;
        buffer.update(&skipped);
        assert!(buffer.get(0).is_none());

        let mut non_updating = sample_params();
        non_updating.update_parameters = false;
        buffer.update(&non_updating);
        assert!(buffer.get(0).is_none());

        buffer.update(&sample_params());
        assert!(buffer.get(0).is_some());
    }

    #[test]
    fn find_ignores_the_grain_seed() {
        let mut buffer = ParamsBuffer::new();
        buffer.update(&sample_params());

        let mut reseeded = sample_params();
        reseeded.grain_seed = 4242;
        assert_eq!(buffer.find(&reseeded), Some(0));
    }

    #[test]
    fn find_misses_on_changed_parameters() {
        let mut buffer = ParamsBuffer::new();
        buffer.update(&sample_params());

        let mut changed = sample_params();
        changed.scaling_points_y[0] = [1, 1];
        assert_eq!(buffer.find(&changed), None);
    }

    #[test]
    fn reset_empties_every_slot() {
        let mut buffer = ParamsBuffer::new();
        let mut params = sample_params();
        buffer.update(&params);
        params.film_grain_param_set_idx = 5;
        buffer.update(&params);

        buffer.reset();
        assert_eq!(buffer.find(&sample_params()), None);
        assert!(buffer.get(0).is_none());
        assert!(buffer.get(5).is_none());
    }

    #[test]
    fn prediction_can_be_disabled() {
        let mut buffer = ParamsBuffer::without_prediction();
        buffer.update(&sample_params());
        // The slot is stored, but lookups pretend it is not there.
        assert!(buffer.get(0).is_some());
        assert_eq!(buffer.find(&sample_params()), None);
    }
}
