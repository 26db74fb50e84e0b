//! Collapses whatever stems a model emits into the vocals/accompaniment pair.

use crate::{audio::AudioBuffer, error::JobError, model::StemMap};

pub const VOCALS: &str = "vocals";
pub const ACCOMPANIMENT: &str = "accompaniment";

#[derive(Debug, Clone, PartialEq)]
pub struct SeparatedStems {
    pub vocals: AudioBuffer,
    pub accompaniment: AudioBuffer,
}

/// Two-stem models pass through. Otherwise every non-vocal stem is summed
/// into the accompaniment. Missing stems become silence shaped like `mix`.
pub fn reconcile(mut stems: StemMap, mix: &AudioBuffer) -> Result<SeparatedStems, JobError> {
    let vocals = stems
        .remove(VOCALS)
        .unwrap_or_else(|| AudioBuffer::zeros_like(mix));

    if let Some(accompaniment) = stems.remove(ACCOMPANIMENT) {
        return Ok(SeparatedStems {
            vocals,
            accompaniment,
        });
    }

    let mut rest = stems.into_values();
    let accompaniment = match rest.next() {
        Some(mut sum) => {
            for stem in rest {
                sum.accumulate(&stem)?;
            }
            sum
        }
        None => AudioBuffer::zeros_like(mix),
    };

    Ok(SeparatedStems {
        vocals,
        accompaniment,
    })
}
