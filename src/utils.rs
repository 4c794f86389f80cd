use std::pin::Pin;

use ethereum_types::{Address, H256};
use futures::Future;

use crate::filters::BlockParam;

pub(crate) trait IntoBoxedFuture: Sized + Send + 'static {
    fn into_boxed_future(self) -> Pin<Box<dyn Future<Output = Self> + Send>> {
        Box::pin(async { self })
    }
}

impl<T, U> IntoBoxedFuture for Result<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
}

/// Returns the real block height that a [BlockParam] points to.
///
/// # Arguments
///
/// * `block` - The block parameter, either a concrete height or a sentinel.
/// * `latest_height` - The height of the current chain head.
///
/// # Returns
///
/// The height the parameter resolves to. `pending` is treated as `latest`,
/// since filters only ever observe executed tipsets.
pub fn to_real_block_number(block: BlockParam, latest_height: u64) -> u64 {
    match block {
        BlockParam::Latest | BlockParam::Pending => latest_height,
        BlockParam::Earliest => 0,
        BlockParam::Number(n) => n,
    }
}

/// Converts a 32-byte slice into a [H256], `None` for any other length.
pub fn h256_from_bytes(bytes: &[u8]) -> Option<H256> {
    (bytes.len() == H256::len_bytes()).then(|| H256::from_slice(bytes))
}

/// Converts a 20-byte slice into an [Address], `None` for any other length.
pub fn address_from_bytes(bytes: &[u8]) -> Option<Address> {
    (bytes.len() == Address::len_bytes()).then(|| Address::from_slice(bytes))
}

/// Parses a `0x`-prefixed hex quantity such as `0x1a`.
pub fn parse_hex_quantity(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
