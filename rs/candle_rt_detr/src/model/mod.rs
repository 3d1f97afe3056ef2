pub mod attention;
pub mod deformable;
pub mod grid_sample;
pub mod init;
pub mod mlp;
pub mod pos_enc;

pub use attention::MultiHeadAttention;
pub use deformable::{
    check_level_start_index, level_start_index, sampling_locations, sampling_offsets_bias,
    MsDeformableAttention, SamplingPlan,
};
pub use grid_sample::{select_sampler, GatherSampler, GridSampler, ScalarSampler};
pub use mlp::Mlp;
pub use pos_enc::PositionEmbedding;
