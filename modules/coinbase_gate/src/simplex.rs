//! Scoped ownership of the simplex token held in chain state.
//!
//! The token is a flag in shared chain state rather than an in-process lock,
//! so that other subsystems (the miner) can see that the UTXO set is being
//! rewritten. Callers release it explicitly with [`SimplexGuard::release`];
//! a guard dropped without release (cancelled future, panic) schedules the
//! release on the current runtime instead.

use anyhow::Result;
use bc_common::ChainState;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct SimplexGuard {
    chain_state: Arc<dyn ChainState>,
    holder: String,
    released: bool,
}

impl SimplexGuard {
    /// Take the token for `holder`, or None if someone else has it
    pub async fn try_acquire(
        chain_state: Arc<dyn ChainState>,
        holder: impl Into<String>,
    ) -> Result<Option<Self>> {
        let holder = holder.into();
        if !chain_state.try_set_simplex(&holder).await? {
            return Ok(None);
        }
        debug!(holder = %holder, "Simplex acquired");
        Ok(Some(Self {
            chain_state,
            holder,
            released: false,
        }))
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.chain_state.del_simplex().await?;
        debug!(holder = %self.holder, "Simplex released");
        Ok(())
    }
}

impl Drop for SimplexGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let chain_state = self.chain_state.clone();
                let holder = std::mem::take(&mut self.holder);
                handle.spawn(async move {
                    if let Err(e) = chain_state.del_simplex().await {
                        error!(holder = %holder, "Failed to release simplex: {e}");
                    }
                });
            }
            Err(_) => warn!(holder = %self.holder, "Simplex guard dropped outside a runtime"),
        }
    }
}
