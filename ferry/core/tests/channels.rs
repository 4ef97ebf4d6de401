// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Channel semantics across workers connected by an in-process mesh.
//!
//! Flush and close return once the receiver has queued the data, so a
//! single test thread can drive every worker in turn.

mod common;

#[cfg(test)]
mod channel_tests {
    use std::sync::Arc;

    use ferry_core::collective::all_gather;
    use ferry_core::data::{BlockPool, ChannelId, Emitter, InMemoryStorage, Multiplexer};
    use ferry_core::dispatcher::Dispatcher;
    use ferry_core::error::{FerryError, Result};
    use ferry_core::net::Group;

    use crate::common;

    fn emitters(workers: &[Multiplexer], channel: ChannelId) -> Vec<Vec<Emitter<i32>>> {
        workers.iter().map(|w| w.open_emitters(channel)).collect()
    }

    fn close_all(emitters: &mut [Vec<Emitter<i32>>]) -> Result<()> {
        for emitter in emitters.iter_mut().flatten() {
            emitter.close()?;
        }
        Ok(())
    }

    #[test]
    fn empty_channel_reader_is_open_and_empty() -> Result<()> {
        let workers = common::local_workers(1)?;
        let channel = common::allocate_channel(&workers);
        let mut reader = workers[0].reader::<i32>(channel);
        assert_eq!(channel, reader.id());
        assert!(!reader.is_closed());
        assert!(!reader.has_next()?);
        Ok(())
    }

    #[test]
    fn channel_closes_after_every_sender_closed() -> Result<()> {
        let workers = common::local_workers(3)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);
        let reader = workers[0].reader::<i32>(channel);

        emitters[0][0].close()?;
        emitters[1][0].close()?;
        assert!(!reader.is_closed());
        emitters[2][0].close()?;
        assert!(reader.is_closed());
        Ok(())
    }

    #[test]
    fn records_are_visible_only_after_flush() -> Result<()> {
        let workers = common::local_workers(2)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);
        let mut reader = workers[0].reader::<i32>(channel);

        emitters[1][0].emit(&1)?;
        assert!(!reader.has_next()?);
        emitters[1][0].flush()?;
        assert!(reader.has_next()?);
        assert_eq!(Some(1), reader.next()?);
        assert!(!reader.has_next()?);

        close_all(&mut emitters)?;
        assert_eq!(None, reader.next()?);
        Ok(())
    }

    #[test]
    fn multiple_flushes_keep_sender_order() -> Result<()> {
        let workers = common::local_workers(3)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);

        let emitter = &mut emitters[2][0];
        emitter.emit(&1)?;
        emitter.flush()?;
        emitter.emit(&2)?;
        emitter.emit(&3)?;
        emitter.flush()?;
        emitter.emit(&4)?;
        emitter.emit(&5)?;
        emitter.emit(&6)?;
        emitter.flush()?;

        let mut reader = workers[0].reader::<i32>(channel);
        assert_eq!(Some(1), reader.next()?);
        assert!(reader.has_next()?);
        assert_eq!(Some(2), reader.next()?);
        assert_eq!(Some(3), reader.next()?);
        assert!(reader.has_next()?);
        assert_eq!(Some(4), reader.next()?);
        assert_eq!(Some(5), reader.next()?);
        assert_eq!(Some(6), reader.next()?);
        assert!(!reader.has_next()?);
        assert!(!reader.is_closed());

        emitters[2][0].emit(&7)?;
        assert!(!reader.has_next()?);
        close_all(&mut emitters)?;
        assert!(reader.is_closed());
        assert_eq!(Some(7), reader.next()?);
        assert_eq!(None, reader.next()?);
        Ok(())
    }

    #[test]
    fn records_of_all_senders_are_merged() -> Result<()> {
        let workers = common::local_workers(3)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);

        emitters[1][0].emit(&2)?;
        emitters[1][0].emit(&3)?;
        emitters[2][0].emit(&1)?;
        emitters[2][0].emit(&4)?;
        emitters[1][0].flush()?;
        emitters[2][0].close()?;

        // worker 1 has only flushed, so read what is visible without waiting
        let mut reader = workers[0].reader::<i32>(channel);
        let mut received = Vec::new();
        while reader.has_next()? {
            received.extend(reader.next()?);
        }
        received.sort_unstable();
        assert_eq!(vec![1, 2, 3, 4], received);
        assert!(!reader.is_closed());

        close_all(&mut emitters[..2])?;
        assert!(reader.is_closed());
        assert_eq!(None, reader.next()?);
        Ok(())
    }

    #[test]
    fn lost_connection_fails_waiting_reader() -> Result<()> {
        common::init_logging();
        let dispatcher = Dispatcher::new("lost-connection", 2)?;
        // worker 1 cannot store a single received record
        let pools = [
            common::memory_pool(&dispatcher, 4096),
            BlockPool::new(
                dispatcher.clone(),
                Arc::new(InMemoryStorage::new()),
                Some(2),
                4096,
            ),
        ];
        let workers: Vec<Multiplexer> = Group::local_mesh(2, 64 * 1024)
            .into_iter()
            .zip(pools)
            .map(|(group, pool)| Multiplexer::new(pool, group))
            .collect();
        let channel = common::allocate_channel(&workers);
        let mut reader = workers[1].reader::<i32>(channel);
        let mut emitters = workers[0].open_emitters::<i32>(channel);

        emitters[1].emit(&7)?;
        assert!(matches!(emitters[1].flush(), Err(FerryError::Cancelled)));
        assert!(matches!(reader.next(), Err(FerryError::Cancelled)));
        assert!(matches!(reader.has_next(), Err(FerryError::Cancelled)));
        assert!(!reader.is_closed());

        // a reader opened after the connection ended does not wait either
        let later = common::allocate_channel(&workers);
        assert!(matches!(
            workers[1].reader::<i32>(later).read_all(),
            Err(FerryError::Cancelled)
        ));
        Ok(())
    }

    #[test]
    fn records_reach_every_destination() -> Result<()> {
        let workers = common::local_workers(3)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);

        for (receiver, emitter) in emitters[1].iter_mut().enumerate() {
            emitter.emit(&(receiver as i32 * 10))?;
            emitter.emit(&(receiver as i32 * 10 + 1))?;
        }
        close_all(&mut emitters)?;

        for (rank, worker) in workers.iter().enumerate() {
            let expected = vec![rank as i32 * 10, rank as i32 * 10 + 1];
            assert_eq!(expected, worker.reader::<i32>(channel).read_all()?);
        }
        Ok(())
    }

    #[test]
    fn large_records_span_several_blocks() -> Result<()> {
        let workers = common::local_workers(2)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters: Vec<Vec<Emitter<String>>> =
            workers.iter().map(|w| w.open_emitters(channel)).collect();

        let records: Vec<String> = (0..200).map(|i| format!("{i:0>100}")).collect();
        for record in &records {
            emitters[0][1].emit(record)?;
        }
        for emitter in emitters.iter_mut().flatten() {
            emitter.close()?;
        }
        assert_eq!(records, workers[1].reader::<String>(channel).read_all()?);
        Ok(())
    }

    #[test]
    fn send_after_close_is_a_protocol_violation() -> Result<()> {
        let workers = common::local_workers(2)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);

        emitters[0][1].close()?;
        let err = emitters[0][1].emit(&7).unwrap_err();
        assert!(matches!(
            err,
            FerryError::ChannelProtocolViolation(c, 0, 1, _) if c == channel
        ));
        Ok(())
    }

    #[test]
    fn duplicate_close_is_a_protocol_violation() -> Result<()> {
        let workers = common::local_workers(2)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);

        emitters[1][1].close()?;
        assert!(emitters[1][1].is_closed());
        let err = emitters[1][1].close().unwrap_err();
        assert!(matches!(err, FerryError::ChannelProtocolViolation(_, 1, 1, _)));
        Ok(())
    }

    #[test]
    fn channels_are_independent() -> Result<()> {
        let workers = common::local_workers(2)?;
        let first = common::allocate_channel(&workers);
        let second = common::allocate_channel(&workers);
        assert_ne!(first, second);

        let mut a = emitters(&workers, first);
        let mut b = emitters(&workers, second);
        a[0][1].emit(&1)?;
        b[0][1].emit(&2)?;
        close_all(&mut b)?;
        close_all(&mut a)?;

        assert_eq!(vec![1], workers[1].reader::<i32>(first).read_all()?);
        assert_eq!(vec![2], workers[1].reader::<i32>(second).read_all()?);
        Ok(())
    }

    #[test]
    fn closed_multiplexer_fails_remote_sends() -> Result<()> {
        let workers = common::local_workers(2)?;
        let channel = common::allocate_channel(&workers);
        let mut emitters = emitters(&workers, channel);

        workers[0].close();
        assert!(workers[0].is_closed());
        emitters[0][1].emit(&1)?;
        assert!(matches!(emitters[0][1].flush(), Err(FerryError::Cancelled)));
        Ok(())
    }

    #[test]
    fn all_gather_orders_items_by_rank() -> Result<()> {
        let workers = common::local_workers(3)?;
        let results = std::thread::scope(|scope| {
            let handles: Vec<_> = workers
                .iter()
                .map(|worker| {
                    scope.spawn(move || {
                        let rank = worker.my_rank() as u32;
                        all_gather(worker, &[rank * 100, rank * 100 + 1])
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("all_gather thread panicked"))
                .collect::<Result<Vec<_>>>()
        })?;

        let expected = vec![0, 1, 100, 101, 200, 201];
        for gathered in results {
            assert_eq!(expected, gathered);
        }
        Ok(())
    }
}
