pub mod accrual;
pub mod buffer;
pub mod settlement;

pub use accrual::{VmBillCycleHandler, ACCRUAL_INTERVAL, DEFAULT_PLATFORM_FEE_BPS};
pub use buffer::{run_flush_loop, StoreUsageSink, UsageBuffer, UsageSink, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_THRESHOLD};
pub use settlement::{
    run_settlement_cycle, run_settlement_loop, SettlementReport, DEFAULT_MIN_SETTLEMENT_MICROS,
    DEFAULT_SETTLEMENT_INTERVAL,
};
