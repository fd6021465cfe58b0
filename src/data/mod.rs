//! Consumer-side data: the reconciled series, the reconciliation engine and
//! the delimited file formats.
pub mod reconcile;
pub mod recording;
pub mod series;

pub use reconcile::{downsample, snap_to_grid, Bucket, MergeOutcome, Reconciler};
pub use series::{Series, SeriesPoint};
