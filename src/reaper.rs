// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Periodic expiry of stale presence rows.
//!
//! Each tick deletes rows older than the presence timeout. If anything was
//! removed, the per-room views changed, so refreshed `presence_update`
//! events go out to every active room's channel and to the global channel,
//! with guest counts attached from the dispatcher's tracker. Errors are
//! logged and the loop continues; the task is cancelled by the shutdown
//! receiver.

use crate::hub::{Channel, Hub};
use crate::json;
use crate::recognize::Dispatcher;
use base::clock::Clocks;
use base::time::Duration;
use base::Error;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Reaper<C: Clocks + Clone = base::clock::RealClocks> {
    db: Arc<db::Database<C>>,
    hub: Arc<Hub>,
    dispatcher: Arc<Dispatcher<C>>,
    presence_timeout: Duration,
    interval: std::time::Duration,
}

impl<C: Clocks + Clone> Reaper<C> {
    pub fn new(
        db: Arc<db::Database<C>>,
        hub: Arc<Hub>,
        dispatcher: Arc<Dispatcher<C>>,
        presence_timeout: Duration,
        interval: std::time::Duration,
    ) -> Self {
        Reaper {
            db,
            hub,
            dispatcher,
            presence_timeout,
            interval,
        }
    }

    pub async fn run(self, shutdown_rx: base::shutdown::Receiver) {
        info!("presence reaper running every {:?}", self.interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.as_future() => break,
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(err) = self.tick() {
                        warn!(err = %err.chain(), "presence cleanup failed");
                    }
                }
            }
        }
        info!("presence reaper shutting down");
    }

    /// One cleanup pass. Public for tests.
    pub fn tick(&self) -> Result<(), Error> {
        let now = self.db.clocks().realtime();
        let cutoff = now - self.presence_timeout;
        let (removed, rooms) = {
            let mut l = self.db.lock();
            let removed = l.cleanup_stale_presence(cutoff)?;
            if removed == 0 {
                return Ok(());
            }
            (removed, l.list_all_presence(cutoff)?)
        };
        info!("removed {removed} stale presence rows");

        for room in rooms {
            let guest_count = self.dispatcher.guest_count(room.room_id);
            let occupants = room.occupants.iter().map(json::Occupant::from_row).collect();
            let msg = json::PresenceMessage::new(
                "presence_update",
                room.room_id,
                room.room_name,
                occupants,
                None,
                guest_count,
                now,
            );
            self.hub.publish_json(Channel::Room(room.room_id), &msg);
            self.hub.publish_json(Channel::Global, &msg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facedet::{Detector, NullDetector};
    use crate::hub::testutil::{collect, json_messages};
    use base::clock::SimulatedClocks;
    use base::time::Time;
    use db::testutil::{self, TestDb};
    use db::vector::VectorIndex;

    #[tokio::test(flavor = "multi_thread")]
    async fn reap_broadcasts_empty_room() {
        testutil::init();
        let clocks = SimulatedClocks::new(Time::from_unix(1706745600, 0));
        let tdb = TestDb::new(clocks.clone());
        let hub = Arc::new(Hub::new());
        let dispatcher = Dispatcher::new(
            tdb.db.clone(),
            Arc::new(VectorIndex::empty(8)),
            Arc::new(NullDetector) as Arc<dyn Detector>,
            hub.clone(),
            crate::recognize::Config::default(),
            tokio::runtime::Handle::current(),
        );
        let reaper = Reaper::new(
            tdb.db.clone(),
            hub.clone(),
            dispatcher,
            Duration::seconds(30),
            std::time::Duration::from_secs(10),
        );
        let room_rx = collect(&hub, Channel::Room(testutil::TEST_ROOM_ID));
        let global_rx = collect(&hub, Channel::Global);

        // Student seen at t=0.
        let t0 = clocks.realtime();
        tdb.db
            .lock()
            .upsert_presence(testutil::TEST_STUDENT_ID, testutil::TEST_ROOM_ID, None, t0, 0.9)
            .unwrap();

        // At t=29 nothing is stale and nothing is broadcast.
        clocks.sleep(Duration::seconds(29));
        reaper.tick().unwrap();
        assert_eq!(json_messages(&room_rx).len(), 0);

        // At t=31 the row expires; both channels hear about the now-empty
        // room.
        clocks.sleep(Duration::seconds(2));
        reaper.tick().unwrap();
        for rx in [&room_rx, &global_rx] {
            let msgs = json_messages(rx);
            assert_eq!(msgs.len(), 1);
            assert_eq!(msgs[0]["type"], "presence_update");
            assert_eq!(msgs[0]["room_id"], testutil::TEST_ROOM_ID);
            assert_eq!(msgs[0]["total_count"], 0);
        }
        assert_eq!(
            tdb.db
                .lock()
                .list_room_presence(testutil::TEST_ROOM_ID, Time::MIN)
                .unwrap()
                .len(),
            0
        );

        // A second tick back-to-back removes nothing and stays quiet.
        reaper.tick().unwrap();
        assert_eq!(json_messages(&room_rx).len(), 0);
    }
}
