mod pool;
pub(crate) mod utils;
