//! Per-address token balances, fed by the chain indexers

use rusqlite::{params, Connection};

use crate::error::NodeError;
use crate::types::Chain;

pub fn upsert_balance(
    conn: &Connection,
    address: &str,
    chain: Chain,
    token: &str,
    amount: f64,
    now: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO balance (address, chain, token, amount, last_update)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (address, chain, token) DO UPDATE SET
            amount = excluded.amount,
            last_update = excluded.last_update",
        params![address, chain.as_str(), token, amount, now],
    )?;
    Ok(())
}

/// Total balance for an address across chains and tokens.
pub fn total_balance(conn: &Connection, address: &str) -> Result<f64, NodeError> {
    let total: Option<f64> = conn.query_row(
        "SELECT SUM(amount) FROM balance WHERE address = ?1",
        params![address],
        |r| r.get(0),
    )?;
    Ok(total.unwrap_or(0.0))
}

/// Addresses that pin at least one file, for the reconciler sweep.
pub fn addresses_with_pins(conn: &Connection) -> Result<Vec<String>, NodeError> {
    let mut stmt = conn.prepare("SELECT DISTINCT owner FROM file_pin")?;
    let rows = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn balances_sum_across_chains() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            upsert_balance(conn, "0xA", Chain::Eth, "ALEPH", 100.0, 1)?;
            upsert_balance(conn, "0xA", Chain::Bnb, "ALEPH", 50.0, 1)?;
            upsert_balance(conn, "0xA", Chain::Eth, "ALEPH", 120.0, 2)?;
            assert_eq!(total_balance(conn, "0xA")?, 170.0);
            assert_eq!(total_balance(conn, "0xB")?, 0.0);
            Ok(())
        })
        .unwrap();
    }
}
