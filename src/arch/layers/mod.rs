mod activation;
mod batch_norm;
mod blocks;
mod conv;
mod linear;
mod pool;

pub use activation::{Dropout, relu, relu_backward};
pub use batch_norm::{BatchNorm2d, BnCache};
pub use blocks::{
    Block, ConvBranch, ConvBranchCache, FactorizedReduce, FactorizedReduceCache,
    PoolBranch, PoolBranchCache, SepConvBN, SepConvBNCache, StdConv, StdConvCache,
};
pub use conv::{Conv2d, ConvCache, ConvSpec};
pub use linear::Linear;
pub use pool::{Pool2d, PoolCache, PoolKind, global_avg_pool, global_avg_pool_backward};

pub(crate) use batch_norm::accumulate;
