use crate::domain::balance::Balance;
use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// One `user_id,available,reserved` row.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct BalanceRecord {
    user_id: String,
    available: i64,
    reserved: i64,
}

/// Reads the wallet balances used to provision users.
pub struct BalanceReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> BalanceReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    /// Rows with negative amounts are rejected as validation errors.
    pub fn balances(self) -> impl Iterator<Item = Result<Balance>> {
        self.reader.into_deserialize().map(|row| -> Result<Balance> {
            let record: BalanceRecord = row?;
            if record.available < 0 || record.reserved < 0 {
                return Err(PaymentError::ValidationError(format!(
                    "balance of {} must not be negative",
                    record.user_id
                )));
            }
            Ok(Balance::new(record.user_id, record.available, record.reserved))
        })
    }
}

/// Writes balances as CSV, one row per user.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_balances(&mut self, balances: impl IntoIterator<Item = Balance>) -> Result<()> {
        for balance in balances {
            self.writer.serialize(BalanceRecord {
                user_id: balance.user_id,
                available: balance.available,
                reserved: balance.reserved,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
