//! Operator implementations behind the kernel variant enum.

pub mod aggregate;
pub mod distribute;
pub mod join;
pub mod orderby;
pub mod output;
pub mod row_ops;
pub mod scan;
pub mod window;
