use anyhow::Result;
use ethers::{
    types::{Address, U256},
    utils::format_units,
};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use std::str::FromStr;

pub fn setup_logger(level: &str) -> Result<()> {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::Info);
    let colors = ColoredLevelConfig::new()
        .trace(Color::Cyan)
        .debug(Color::Blue)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stdout())
        .level(LevelFilter::Warn)
        .level_for("zeus_holders", level)
        .apply()?;

    Ok(())
}

/// Parses a `0x`-prefixed, 40 hex digit address. Anything else is rejected.
pub fn parse_address(input: &str) -> Option<Address> {
    let hex_part = input.trim().strip_prefix("0x").or_else(|| input.trim().strip_prefix("0X"))?;
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Address::from_str(hex_part).ok()
}

/// Lowercase hex form used for cache keys and JSON output.
pub fn address_key(address: &Address) -> String {
    format!("{:#x}", address)
}

/// Base units to a human amount. Precision loss past f64 is accepted for display.
pub fn format_amount(raw: U256, decimals: u8) -> f64 {
    format_units(raw, decimals as u32)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Rescales an amount between token precisions.
pub fn normalize_decimals(amount: U256, from_decimals: u8, to_decimals: u8) -> U256 {
    if from_decimals == to_decimals {
        amount
    } else if from_decimals < to_decimals {
        amount.saturating_mul(U256::exp10((to_decimals - from_decimals) as usize))
    } else {
        amount / U256::exp10((from_decimals - to_decimals) as usize)
    }
}
