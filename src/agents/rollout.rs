/// Canary / batch / full wave splitting for state-changing rollouts.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    pub name: &'static str,
    pub targets: Vec<String>,
    /// Cumulative share of the resource set covered once this wave is done.
    pub percentage: u32,
}

/// Splits `resources` (in order) into up to three waves:
///
/// - `canary`: the first `canary_size` resources (at least one),
/// - `batch`: the next `ceil(n * max_batch_fraction)` resources,
/// - `full`: everything left.
///
/// Waves that would be empty collapse into the next one, so small sets
/// produce fewer waves and a set no larger than the canary is a single
/// `full` wave.
pub fn split_rollout(resources: &[String], canary_size: usize, max_batch_fraction: f64) -> Vec<Wave> {
    let total = resources.len();
    if total == 0 {
        return Vec::new();
    }
    let canary = canary_size.max(1);
    if total <= canary {
        return vec![wave("full", resources, total, total)];
    }

    let fraction = if max_batch_fraction.is_finite() {
        max_batch_fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let batch = ((total as f64 * fraction).ceil() as usize).max(1);

    let mut waves = vec![wave("canary", &resources[..canary], canary, total)];
    if canary + batch >= total {
        waves.push(wave("full", &resources[canary..], total, total));
        return waves;
    }
    waves.push(wave("batch", &resources[canary..canary + batch], canary + batch, total));
    waves.push(wave("full", &resources[canary + batch..], total, total));
    waves
}

fn wave(name: &'static str, targets: &[String], covered: usize, total: usize) -> Wave {
    Wave {
        name,
        targets: targets.to_vec(),
        percentage: ((covered * 100) / total) as u32,
    }
}
