//! Batch and memory limits

use inferlet_core::{BatchLimits, DeployMode, GpuFamily, GpuProfile};
use tracing::warn;

/// GPU memory fraction when one engine owns the device
const SINGLE_MODEL_FRACTION: f32 = 0.90;
/// GPU memory fraction left to the chat engine when the tool engine shares the device
const SHARED_FRACTION: f32 = 0.70;

const SMALL_VRAM_GB: u32 = 24;

/// (max batched tokens, max sequences) per family
fn family_defaults(family: GpuFamily) -> (u32, u32) {
    match family {
        GpuFamily::Blackwell => (32_768, 512),
        GpuFamily::Hopper => (16_384, 256),
        GpuFamily::Ada | GpuFamily::Ampere => (8_192, 128),
        GpuFamily::Volta | GpuFamily::Turing | GpuFamily::Unknown => (4_096, 64),
    }
}

/// Compute batching knobs for `mode` on `gpu`.
///
/// `capacity` is the configured concurrent-connection limit and bounds the
/// sequence count. Mixture-of-experts models get half the sequence cap.
pub fn batch_limits(mode: DeployMode, gpu: &GpuProfile, capacity: u32, moe: bool) -> BatchLimits {
    let family = gpu.family();
    if family == GpuFamily::Unknown {
        warn!(gpu = %gpu.name, arch = %gpu.sm_arch, "Unknown GPU family, using conservative batch limits");
    }

    let (mut max_batched_tokens, mut seq_cap) = family_defaults(family);
    if gpu.vram_gb < SMALL_VRAM_GB {
        max_batched_tokens /= 2;
    }
    if moe {
        seq_cap /= 2;
    }

    let gpu_memory_fraction = match mode {
        DeployMode::Both => SHARED_FRACTION,
        DeployMode::Chat | DeployMode::Tool => SINGLE_MODEL_FRACTION,
    };

    BatchLimits {
        max_num_seqs: capacity.max(1).min(seq_cap),
        max_batched_tokens,
        gpu_memory_fraction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inferlet_core::SmArch;

    #[test]
    fn test_shared_deployments_reserve_less() {
        let gpu = GpuProfile::new("H100", SmArch(90), 80);
        let both = batch_limits(DeployMode::Both, &gpu, 100, false);
        let chat = batch_limits(DeployMode::Chat, &gpu, 100, false);
        assert!(both.gpu_memory_fraction < chat.gpu_memory_fraction);
        assert_eq!(chat.gpu_memory_fraction, 0.90);
    }

    #[test]
    fn test_newer_families_batch_more() {
        let hopper = batch_limits(DeployMode::Chat, &GpuProfile::new("H100", SmArch(90), 80), 64, false);
        let ampere = batch_limits(DeployMode::Chat, &GpuProfile::new("A100", SmArch(80), 80), 64, false);
        let blackwell = batch_limits(DeployMode::Chat, &GpuProfile::new("B200", SmArch(100), 180), 64, false);
        assert_eq!(ampere.max_batched_tokens, 8_192);
        assert_eq!(hopper.max_batched_tokens, 16_384);
        assert_eq!(blackwell.max_batched_tokens, 32_768);
    }

    #[test]
    fn test_small_cards_halve_tokens() {
        let limits = batch_limits(DeployMode::Chat, &GpuProfile::new("L4", SmArch(89), 22), 64, false);
        assert_eq!(limits.max_batched_tokens, 4_096);
    }

    #[test]
    fn test_sequences_bounded_by_capacity_and_cap() {
        let gpu = GpuProfile::new("H100", SmArch(90), 80);
        assert_eq!(batch_limits(DeployMode::Chat, &gpu, 32, false).max_num_seqs, 32);
        assert_eq!(batch_limits(DeployMode::Chat, &gpu, 1_000, false).max_num_seqs, 256);
        assert_eq!(batch_limits(DeployMode::Chat, &gpu, 1_000, true).max_num_seqs, 128);
        assert_eq!(batch_limits(DeployMode::Chat, &gpu, 0, false).max_num_seqs, 1);
    }

    #[test]
    fn test_unknown_family_is_conservative() {
        let gpu = GpuProfile::new("Mystery", SmArch(61), 32);
        let limits = batch_limits(DeployMode::Both, &gpu, 500, false);
        assert_eq!(limits.max_batched_tokens, 4_096);
        assert_eq!(limits.max_num_seqs, 64);
    }
}
