use std::env;
use std::io;
use std::path::Path;
use std::process::ExitCode;

use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use txs_saga::csv::{read_accounts, read_transfers, write_balances};
use txs_saga::{Engine, SagaConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let (Some(accounts_path), Some(transfers_path)) = (args.next(), args.next()) else {
        eprintln!("usage: txs-saga <accounts.csv> <transfers.csv>");
        return ExitCode::from(2);
    };

    let config = match SagaConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let engine = Engine::with_config(config);

    let accounts = match read_accounts(Path::new(&accounts_path)) {
        Ok(rows) => rows,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let mut parties = Vec::new();
    for result in accounts {
        match result.map(|party| engine.register(&party).map(|()| party)) {
            Ok(Ok(party)) => parties.push(party),
            Ok(Err(e)) => warn!("{e}"),
            Err(e) => warn!("{e}"),
        }
    }

    let transfers = match read_transfers(Path::new(&transfers_path)) {
        Ok(rows) => rows,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let refill = engine.start_quota_refill();
    let (request_sender, request_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in transfers {
            match result {
                Ok(request) => {
                    if request_sender.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    let records = engine.run(ReceiverStream::new(request_receiver)).await;
    if let Some(refill) = refill {
        refill.abort();
    }

    for record in &records {
        if record.failed() {
            warn!(tx_id = record.transaction_id(), "transfer failed\n{record}");
        } else {
            info!(tx_id = record.transaction_id(), "transfer completed\n{record}");
        }
    }

    parties.sort_by_key(|party| party.key());
    let resources = engine.resources();
    let balances = parties.into_iter().map(|mut party| {
        let key = party.key();
        if let Ok(balance) = resources.ledger.balance(&key) {
            party.amount = balance;
        }
        let locked = resources.locks.is_locked(&key);
        (party, locked)
    });

    if let Err(e) = write_balances(io::stdout().lock(), balances) {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
