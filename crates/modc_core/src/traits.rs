use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that expressions can be evaluated in.
/// Must support floating-point arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}
