//! Neural Network Layers
//!
//! Every layer of the transformer, each with a forward and a hand-written
//! backward pass.
//!
//! ## Layers
//!
//! - **embedding**: token and position lookup tables
//! - **linear**: fully connected layer
//! - **layer_norm**: layer normalization
//! - **activation**: GELU
//! - **dropout**: seeded dropout
//! - **mlp**: feed-forward sub-layer
//! - **attention**: multi-head causal self-attention
//! - **block**: transformer block
//!
//! ## Design Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, Cache) { }
//!     pub fn backward(&self, grad: &Tensor, cache: &Cache) -> Gradients { }
//! }
//! ```
//!
//! `rng` is `Some` only while training; it drives dropout. The `Gradients`
//! struct carries the parameter gradients plus `x`, the gradient with respect
//! to the layer input, and can flatten itself in the same order in which
//! [`Parameterized`] visits the layer's tensors.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod embedding;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

use crate::tensor::Tensor;

pub use activation::{gelu_backward, gelu_forward};
pub use attention::{causal_mask, AttentionCache, AttentionGradients, CausalSelfAttention};
pub use block::{BlockCache, BlockGradients, TransformerBlock};
pub use dropout::{Dropout, DropoutCache};
pub use embedding::Embedding;
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{normal_init, Linear, LinearCache, LinearGradients, INIT_STD};
pub use mlp::{Mlp, MlpCache, MlpGradients};

/// A layer that owns learnable tensors
///
/// `visit` and `visit_mut` walk the tensors in a fixed canonical order and
/// pass along whether AdamW should apply weight decay to each (true only for
/// linear weight matrices).
pub trait Parameterized {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool));
    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool));
}
