//! Domain types: work units, partition rows and row quality flags.

pub mod partition;
pub mod row;
pub mod work_unit;

pub use partition::{
    canonicalize, check_ordering, series_ranges, OrderingError, PartitionData, PartitionRows,
};
pub use row::{
    is_missing_price, Contract, ContractKey, GreeksRow, OhlcRow, OptionOhlcRow, Right, RowQuality,
    SeriesRow,
};
pub use work_unit::{DataKind, WorkUnit};
