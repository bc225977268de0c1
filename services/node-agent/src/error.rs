//! Error display for the CLI.

use colored::Colorize;
use plinth_block::BlockError;
use plinth_node::CsrError;

/// Print an error with a hint where one helps.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(block_err) = err.downcast_ref::<BlockError>() {
        if block_err.is_config() {
            eprintln!(
                "\n{}",
                "Hint: the bootstrap request is incomplete; check --request or the cluster's request object."
                    .yellow()
            );
        } else if block_err.to_string().contains(plinth_block::RETRY_WORD) {
            eprintln!(
                "\n{}",
                "Hint: the failure looks transient. Every step is idempotent, rerun the same command."
                    .yellow()
            );
        }
    }

    if let Some(csr_err) = err.downcast_ref::<CsrError>() {
        match csr_err {
            CsrError::Denied { .. } | CsrError::Failed { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: delete the CSR and check the bootstrap token's RBAC before retrying."
                        .yellow()
                );
            }
            CsrError::NotIssued { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: approve the CSR with `kubectl certificate approve`.".yellow()
                );
            }
        }
    }
}
