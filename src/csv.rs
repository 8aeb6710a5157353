use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::{Amount, Bank, Party, TransferRequest};

/// Errors that can occur when reading or writing csv files
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open {}: {source}", path.display())]
    Open { path: PathBuf, source: csv::Error },

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("failed to write csv: {0}")]
    Write(#[from] csv::Error),

    #[error("failed to flush csv: {0}")]
    Flush(#[from] io::Error),
}

#[derive(Debug, Deserialize)]
struct AccountRow {
    username: String,
    bank: Bank,
    balance: Amount,
}

#[derive(Debug, Deserialize)]
struct TransferRow {
    sender: String,
    sender_bank: Bank,
    receiver: String,
    receiver_bank: Bank,
    amount: Amount,
}

#[derive(Debug, Serialize)]
struct BalanceRow<'a> {
    account: &'a str,
    bank: &'static str,
    balance: i64,
    locked: bool,
}

fn open(path: &Path) -> Result<csv::Reader<std::fs::File>, CsvError> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| CsvError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn rows<T: serde::de::DeserializeOwned>(
    reader: csv::Reader<std::fs::File>,
) -> impl Iterator<Item = Result<T, CsvError>> {
    reader
        .into_deserialize::<T>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            result.map_err(|source| CsvError::Parse { line, source })
        })
}

/// Read accounts to register, one `username,bank,balance` row each
pub fn read_accounts(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Party, CsvError>> + use<>, CsvError> {
    let reader = open(path)?;
    Ok(rows::<AccountRow>(reader)
        .map(|row| row.map(|row| Party::new(row.username, row.bank, row.balance))))
}

/// Read transfer requests, one
/// `sender,sender_bank,receiver,receiver_bank,amount` row each
pub fn read_transfers(
    path: &Path,
) -> Result<impl Iterator<Item = Result<TransferRequest, CsvError>> + use<>, CsvError> {
    let reader = open(path)?;
    Ok(rows::<TransferRow>(reader).map(|row| {
        row.map(|row| {
            TransferRequest::new(
                row.amount,
                Party::new(row.sender, row.sender_bank, Amount::ZERO),
                Party::new(row.receiver, row.receiver_bank, Amount::ZERO),
            )
        })
    }))
}

/// Write final balances in csv format.
///
/// Each party carries its current balance in `amount`; the flag tells
/// whether its account is still locked.
pub fn write_balances(
    writer: impl io::Write,
    accounts: impl IntoIterator<Item = (Party, bool)>,
) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(writer);

    for (party, locked) in accounts {
        writer.serialize(BalanceRow {
            account: &party.username,
            bank: party.bank.as_str(),
            balance: party.amount.value(),
            locked,
        })?;
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn read_account() {
        let file = write_csv("username,bank,balance\nalice,BankA,2000\n");
        let results: Vec<_> = read_accounts(file.path()).unwrap().collect();
        assert_eq!(results.len(), 1);

        let party = results.into_iter().next().unwrap().unwrap();
        assert_eq!(party, Party::new("alice", Bank::BankA, Amount::new(2000)));
    }

    #[test]
    fn read_transfer() {
        let file = write_csv(
            "sender,sender_bank,receiver,receiver_bank,amount\nalice,BankA,bob,BankB,450\n",
        );
        let results: Vec<_> = read_transfers(file.path()).unwrap().collect();
        assert_eq!(results.len(), 1);

        let request = results.into_iter().next().unwrap().unwrap();
        assert_eq!(request.amount, Amount::new(450));
        assert_eq!(request.sender.key().as_str(), "alice-BankA");
        assert_eq!(request.receiver.key().as_str(), "bob-BankB");
    }

    #[test]
    fn read_with_whitespace() {
        let file = write_csv("username, bank, balance\n alice , BankA, 10\n");
        let results: Vec<_> = read_accounts(file.path()).unwrap().collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn unknown_bank_is_reported_with_line() {
        let file = write_csv("username,bank,balance\nalice,BankA,10\nbob,BankZ,10\n");
        let results: Vec<_> = read_accounts(file.path()).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(matches!(err, CsvError::Parse { line: 3, .. }));
    }

    #[test]
    fn fractional_amount_is_rejected() {
        let file = write_csv(
            "sender,sender_bank,receiver,receiver_bank,amount\nalice,BankA,bob,BankB,4.5\n",
        );
        let results: Vec<_> = read_transfers(file.path()).unwrap().collect();
        assert!(matches!(
            results[0].as_ref().unwrap_err(),
            CsvError::Parse { line: 2, .. }
        ));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_accounts(&dir.path().join("missing.csv"));
        assert!(matches!(result, Err(CsvError::Open { .. })));
    }

    #[test]
    fn rows_outlive_the_path() {
        let file = write_csv(
            "sender,sender_bank,receiver,receiver_bank,amount\nalice,BankA,bob,BankB,450\n",
        );
        let path = file.path().to_path_buf();
        let rows = read_transfers(&path).unwrap();
        drop(path);

        let count = std::thread::spawn(move || rows.count()).join().unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn write_balances_rows() {
        let mut out = Vec::new();
        write_balances(
            &mut out,
            [
                (Party::new("alice", Bank::BankA, Amount::new(1550)), false),
                (Party::new("bob", Bank::BankB, Amount::new(-20)), true),
            ],
        )
        .unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "account,bank,balance,locked\nalice,BankA,1550,false\nbob,BankB,-20,true\n"
        );
    }
}
