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

//! Groups of already-connected byte streams, one per peer worker.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::FerryConfig;
use crate::error::{FerryError, Result};

/// An ordered, reliable byte stream to one peer.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Connection to the peer worker `peer`.
pub struct Connection {
    peer: usize,
    stream: Box<dyn Transport>,
}

impl Connection {
    pub fn new(peer: usize, stream: impl Transport) -> Self {
        Self {
            peer,
            stream: Box::new(stream),
        }
    }

    pub fn peer(&self) -> usize {
        self.peer
    }

    pub(crate) fn into_stream(self) -> Box<dyn Transport> {
        self.stream
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

/// One worker's connections to every worker of the job, indexed by worker
/// id. The slot of the worker itself is empty.
#[derive(Debug)]
pub struct Group {
    my_rank: usize,
    connections: Vec<Option<Connection>>,
}

impl Group {
    pub fn new(my_rank: usize, connections: Vec<Option<Connection>>) -> Result<Self> {
        if my_rank >= connections.len() {
            return Err(FerryError::Configuration(format!(
                "Worker rank {my_rank} out of range for a group of {}",
                connections.len()
            )));
        }
        for (rank, connection) in connections.iter().enumerate() {
            match connection {
                None if rank == my_rank => {}
                Some(c) if rank != my_rank && c.peer() == rank => {}
                Some(c) if rank == my_rank => {
                    return Err(FerryError::Configuration(format!(
                        "Worker {my_rank} has a connection to itself (peer {})",
                        c.peer()
                    )))
                }
                Some(c) => {
                    return Err(FerryError::Configuration(format!(
                        "Connection in slot {rank} leads to worker {}",
                        c.peer()
                    )))
                }
                None => {
                    return Err(FerryError::Configuration(format!(
                        "Worker {my_rank} has no connection to worker {rank}"
                    )))
                }
            }
        }
        Ok(Self {
            my_rank,
            connections,
        })
    }

    /// Builds a full mesh of `num_workers` in-process groups over duplex
    /// pipes with `capacity` bytes of buffer each way.
    pub fn local_mesh(num_workers: usize, capacity: usize) -> Vec<Group> {
        let mut mesh: Vec<Vec<Option<Connection>>> = (0..num_workers)
            .map(|_| (0..num_workers).map(|_| None).collect())
            .collect();
        for i in 0..num_workers {
            for j in i + 1..num_workers {
                let (a, b) = tokio::io::duplex(capacity);
                mesh[i][j] = Some(Connection::new(j, a));
                mesh[j][i] = Some(Connection::new(i, b));
            }
        }
        mesh.into_iter()
            .enumerate()
            .map(|(my_rank, connections)| Group {
                my_rank,
                connections,
            })
            .collect()
    }

    /// [`local_mesh`](Self::local_mesh) with the configured duplex capacity.
    pub fn local_mesh_from_config(num_workers: usize, config: &FerryConfig) -> Vec<Group> {
        Self::local_mesh(num_workers, config.duplex_capacity())
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    pub fn num_workers(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn into_connections(self) -> Vec<Option<Connection>> {
        self.connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_mesh_leaves_own_slot_empty() {
        let groups = Group::local_mesh(3, 1024);
        assert_eq!(3, groups.len());
        for (rank, group) in groups.iter().enumerate() {
            assert_eq!(rank, group.my_rank());
            assert_eq!(3, group.num_workers());
            for (peer, connection) in group.connections.iter().enumerate() {
                match connection {
                    Some(c) => assert_eq!(peer, c.peer()),
                    None => assert_eq!(rank, peer),
                }
            }
        }
    }

    #[tokio::test]
    async fn mesh_from_config_uses_duplex_capacity() -> Result<()> {
        use futures::FutureExt;
        use tokio::io::AsyncWriteExt;

        use crate::config::FERRY_CHANNEL_DUPLEX_CAPACITY;

        let config = FerryConfig::default().with(FERRY_CHANNEL_DUPLEX_CAPACITY, "128")?;
        let mut groups = Group::local_mesh_from_config(2, &config);
        assert_eq!(2, groups.len());
        let mut connections = groups.remove(0).into_connections();
        let Some(mut connection) = connections[1].take() else {
            panic!("worker 0 has no connection to worker 1");
        };

        // the peer never reads, so a write beyond the capacity stays pending
        let accepted = connection.stream.write(&[7u8; 1024]).await?;
        assert_eq!(128, accepted);
        assert!(connection.stream.write(&[7u8; 1]).now_or_never().is_none());
        Ok(())
    }

    #[test]
    fn rejects_incomplete_groups() {
        let (a, _b) = tokio::io::duplex(16);
        assert!(Group::new(0, vec![None, None]).is_err());
        assert!(Group::new(2, vec![None, Some(Connection::new(1, a))]).is_err());
        assert!(Group::new(0, vec![None]).is_ok());
    }
}
