//! Per-packet strategy engine
//!
//! Assembles the full emission plan for one matched packet —
//! mutation, SACK strip, desync, fakes, real segments, inbound
//! forgeries — and plays it out through the raw sender. The plan is
//! built synchronously and executed on its own task so the queue
//! callback returns immediately; the only awaits are the programmed
//! inter-segment delays.
//!
//! `MATCHED -> FAKE_EMIT (0..) -> REAL_EMIT (1..) -> VERDICT_DROP`:
//! there is no retry, the kernel has already dropped the original by
//! the time the plan runs. Send failures are logged and the rest of
//! the plan continues.

use crate::config::{MutationMode, SetConfig};
use crate::error::Result;
use crate::packet::{options, PacketInfo};
use crate::sock::RawSender;
use crate::strategies::{self, Emission};
use rand::Rng;
use tracing::{debug, error};

/// Build the complete emission plan for a matched packet.
pub fn plan_packet<R: Rng>(packet: &[u8], set: &SetConfig, rng: &mut R) -> Result<Vec<Emission>> {
    let mut work = packet.to_vec();
    let mut info = PacketInfo::parse(&work)?;

    if set.faking.mutation.mode != MutationMode::Off {
        work = strategies::mutate_client_hello(&work, &info, set, rng);
        info = PacketInfo::parse(&work)?;
    }
    if set.tcp.strip_sack && info.transport_header_len > 20 {
        work = options::strip_sack(&work, &info);
        info = PacketInfo::parse(&work)?;
    }

    let mut plan = strategies::plan_desync(&work, &info, set);
    plan.extend(strategies::plan_fakes(&work, &info, set, rng));
    plan.extend(strategies::plan_strategy(
        set.fragmentation.strategy,
        &work,
        &info,
        set,
        rng,
    ));
    plan.extend(strategies::plan_incoming(&work, &info, set, rng));

    debug!(
        strategy = ?set.fragmentation.strategy,
        emissions = plan.len(),
        payload = info.payload_len,
        "plan assembled"
    );
    Ok(plan)
}

/// The plan for an outbound SYN when the set asks for SYN fakes.
pub fn plan_syn<R: Rng>(packet: &[u8], set: &SetConfig, _rng: &mut R) -> Result<Vec<Emission>> {
    let info = PacketInfo::parse(packet)?;
    Ok(strategies::plan_syn_fake(packet, &info, set)
        .into_iter()
        .collect())
}

/// Play a plan out through the raw sender. Transient send failures do
/// not abort the sequence.
pub async fn execute(sender: &RawSender, plan: Vec<Emission>) {
    for emission in plan {
        if let Err(err) = sender.send(&emission.data) {
            error!(%err, len = emission.data.len(), "packet injection failed");
        }
        if !emission.delay_after.is_zero() {
            tokio::time::sleep(emission.delay_after).await;
        }
    }
}
