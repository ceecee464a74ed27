//! Wire protocols spoken to the host side.

pub mod synta;
