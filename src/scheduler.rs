//! Diffusion timestep schedule construction.
//!
//! Flow-matching schedules are descending sequences of timesteps in `(0, 1]`.
//! Three sources, in priority order:
//!
//! 1. An explicit timestep list — trailing zeros dropped, capped at
//!    [`MAX_STEPS`], each entry snapped to the nearest admissible value.
//! 2. `inference_steps > 0` — uniform `tᵢ = 1 − i/N`, then remapped through
//!    `t' = shift·t / (1 + (shift−1)·t)` when `shift ≠ 1`. The remap
//!    concentrates steps near the data end for `shift > 1`.
//! 3. Neither — the precomputed 8-step turbo table for `shift` snapped to
//!    the nearest of {1, 2, 3}.

/// Hard cap on schedule length.
pub const MAX_STEPS: usize = 20;

/// The 20 admissible timestep values (union of the turbo tables), descending.
///
/// Externally supplied schedules are snapped onto this grid so that
/// floating-point drift in a round-tripped schedule cannot move a step off
/// the values the model was distilled on.
pub const ADMISSIBLE_TIMESTEPS: [f64; 20] = [
    1.0,
    0.9545454545454546,
    0.9333333333333333,
    0.9,
    0.875,
    0.8571428571428571,
    0.8333333333333334,
    0.7692307692307693,
    0.75,
    0.6666666666666666,
    0.6428571428571429,
    0.625,
    0.5454545454545454,
    0.5,
    0.4,
    0.375,
    0.3,
    0.25,
    0.2222222222222222,
    0.125,
];

/// Remap a timestep through the shift transform.
///
/// `t' = shift·t / (1 + (shift−1)·t)` — identity at `shift = 1`, fixed
/// points at 0 and 1.
pub fn shift_timestep(shift: f64, t: f64) -> f64 {
    shift * t / (1.0 + (shift - 1.0) * t)
}

/// Snap a timestep to the nearest admissible value.
pub fn nearest_admissible(t: f64) -> f64 {
    *ADMISSIBLE_TIMESTEPS
        .iter()
        .min_by(|a, b| {
            ((*a - t).abs())
                .partial_cmp(&((*b - t).abs()))
                .expect("admissible table contains no NaN")
        })
        .expect("admissible table is non-empty")
}

/// The precomputed 8-step turbo table for `shift` snapped to {1, 2, 3}.
pub fn preset_schedule(shift: f64) -> Vec<f64> {
    let snapped = [1.0f64, 2.0, 3.0]
        .into_iter()
        .min_by(|a, b| {
            ((a - shift).abs())
                .partial_cmp(&((b - shift).abs()))
                .expect("shift is finite")
        })
        .expect("candidate set is non-empty");
    // Each table is the uniform 8-step grid pushed through its shift remap.
    (0..8)
        .map(|i| shift_timestep(snapped, 1.0 - i as f64 / 8.0))
        .collect()
}

/// Build the timestep schedule for one generation run.
///
/// See the module docs for the three construction paths. The result is
/// strictly decreasing, non-empty, within `(0, 1]`, and at most
/// [`MAX_STEPS`] long.
pub fn build_schedule(shift: f64, inference_steps: usize, timesteps: Option<&[f64]>) -> Vec<f64> {
    if let Some(ts) = timesteps {
        if !ts.is_empty() {
            let trailing_zeros = ts.iter().rev().take_while(|&&t| t <= 0.0).count();
            let kept = &ts[..ts.len() - trailing_zeros];
            let schedule: Vec<f64> = kept
                .iter()
                .take(MAX_STEPS)
                .map(|&t| nearest_admissible(t))
                .collect();
            if !schedule.is_empty() {
                return schedule;
            }
        }
    }

    if inference_steps > 0 {
        let n = inference_steps.min(MAX_STEPS);
        return (0..n)
            .map(|i| {
                let t = 1.0 - i as f64 / n as f64;
                if shift == 1.0 {
                    t
                } else {
                    shift_timestep(shift, t)
                }
            })
            .collect();
    }

    preset_schedule(shift)
}
