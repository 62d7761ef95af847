//! Field names shared by actors, the replay buffer, the wire protocol and the
//! training loss.

/// Observation planes, f32, `[C, H, W]` per step.
pub const OBS: &str = "s";
/// Value target, f32, length 1 or a fixed vector per step.
pub const VALUE: &str = "v";
/// Policy target over the action space, f32; sums to 1 over legal entries.
pub const POLICY: &str = "pi";
/// Legality mask, u8, same shape as the policy target.
pub const POLICY_MASK: &str = "pi_mask";
/// Optional auxiliary prediction target, f32.
pub const AUX: &str = "aux";
/// Mask for the auxiliary target, u8.
pub const AUX_MASK: &str = "aux_mask";
/// Optional recurrent-state slice carried alongside a step, f32.
pub const RNN_STATE: &str = "rnn_state";
/// Per-timestep continue mask for sequence slots, u8; 0 marks a segment start.
pub const RNN_CONT: &str = "rnn_cont";

/// Fields present in every sample.
pub const REQUIRED: [&str; 4] = [OBS, VALUE, POLICY, POLICY_MASK];
