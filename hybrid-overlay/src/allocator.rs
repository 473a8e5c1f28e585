// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host subnet allocation across every configured cluster subnet

use crate::node::Node;
use crate::node::EXTERNAL_SUBNET;
use crate::subnet_allocator::SubnetAllocator;
use crate::subnet_allocator::SubnetAllocatorError;
use crate::subnet_allocator::SubnetPool;
use ipnetwork::IpNetwork;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use slog_error_chain::SlogInlineError;
use std::sync::Mutex;

/// A range from which host subnets of `host_subnet_length` are allocated.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct ClusterSubnet {
    pub cidr: Ipv4Network,
    pub host_subnet_length: u8,
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum NewAllocatorError {
    #[error("error creating subnet allocator for {cidr}")]
    Pool {
        cidr: Ipv4Network,
        #[source]
        err: SubnetAllocatorError,
    },

    #[error("cluster subnets {first} and {second} overlap")]
    Overlap { first: Ipv4Network, second: Ipv4Network },
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum AllocateError {
    #[error("no available subnets to allocate")]
    Exhausted,

    #[error("failed to allocate from {cidr}")]
    Pool {
        cidr: Ipv4Network,
        #[source]
        err: SubnetAllocatorError,
    },
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ReleaseError {
    #[error("subnet {0} not found in any cluster subnet or already available")]
    NotFound(IpNetwork),
}

/// Allocates host subnets from an ordered list of pools.
///
/// Allocation walks the pools in order and moves on to the next pool only
/// when the current one is full. A subnet does not record which pool it came
/// from, so release offers it to each pool in turn.
#[derive(Debug)]
pub struct MasterSubnetAllocator {
    log: Logger,
    pools: Mutex<Vec<Box<dyn SubnetPool>>>,
}

impl MasterSubnetAllocator {
    /// Build one pool per entry in `subnets`, treating every
    /// [`EXTERNAL_SUBNET`] recorded on `nodes` as already allocated.
    ///
    /// Annotations that fail to parse are logged and skipped.
    pub fn from_nodes(
        log: &Logger,
        subnets: &[ClusterSubnet],
        nodes: &[Node],
    ) -> Result<Self, NewAllocatorError> {
        let already_allocated: Vec<IpNetwork> = nodes
            .iter()
            .filter_map(|node| match node.subnet_annotation(EXTERNAL_SUBNET) {
                Ok(subnet) => subnet,
                Err(error) => {
                    warn!(
                        log,
                        "error parsing already allocated host subnet";
                        "node" => &node.name,
                        "error" => &error,
                    );
                    None
                }
            })
            .collect();
        Self::new(log, subnets, &already_allocated)
    }

    /// Build one pool per entry in `subnets`, in order. Each subnet in
    /// `already_allocated` is marked in use in the pool whose range contains
    /// it; subnets outside every range are ignored.
    pub fn new(
        log: &Logger,
        subnets: &[ClusterSubnet],
        already_allocated: &[IpNetwork],
    ) -> Result<Self, NewAllocatorError> {
        for (i, first) in subnets.iter().enumerate() {
            for second in &subnets[i + 1..] {
                if first.cidr.contains(second.cidr.network())
                    || second.cidr.contains(first.cidr.network())
                {
                    return Err(NewAllocatorError::Overlap {
                        first: first.cidr,
                        second: second.cidr,
                    });
                }
            }
        }

        let mut pools: Vec<Box<dyn SubnetPool>> =
            Vec::with_capacity(subnets.len());
        for subnet in subnets {
            let in_use: Vec<Ipv4Network> = already_allocated
                .iter()
                .filter_map(|allocated| match allocated {
                    IpNetwork::V4(v4) if subnet.cidr.contains(v4.network()) => {
                        Some(*v4)
                    }
                    _ => None,
                })
                .collect();
            let pool = SubnetAllocator::new(
                subnet.cidr,
                subnet.host_subnet_length,
                &in_use,
            )
            .map_err(|err| NewAllocatorError::Pool { cidr: subnet.cidr, err })?;
            info!(
                log,
                "created host subnet allocator";
                "cidr" => %pool.cidr(),
                "host_subnet_length" => pool.host_subnet_length(),
                "capacity" => pool.capacity(),
                "in_use" => pool.allocated(),
            );
            pools.push(Box::new(pool));
        }
        Ok(Self::with_pools(log, pools))
    }

    /// Build an allocator over caller-supplied pools.
    pub fn with_pools(log: &Logger, pools: Vec<Box<dyn SubnetPool>>) -> Self {
        Self {
            log: log.new(o!("component" => "MasterSubnetAllocator")),
            pools: Mutex::new(pools),
        }
    }

    /// Allocate a host subnet from the first pool that has one.
    pub fn allocate(&self) -> Result<IpNetwork, AllocateError> {
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.iter_mut() {
            match pool.allocate() {
                Ok(subnet) => {
                    debug!(self.log, "allocated subnet"; "subnet" => %subnet);
                    return Ok(IpNetwork::V4(subnet));
                }
                Err(SubnetAllocatorError::Full(cidr)) => {
                    debug!(
                        self.log,
                        "cluster subnet exhausted";
                        "cidr" => %cidr,
                    );
                }
                Err(err) => {
                    return Err(AllocateError::Pool { cidr: pool.cidr(), err });
                }
            }
        }
        Err(AllocateError::Exhausted)
    }

    /// Return `subnet` to whichever pool allocated it.
    pub fn release(&self, subnet: IpNetwork) -> Result<(), ReleaseError> {
        let mut pools = self.pools.lock().unwrap();
        for pool in pools.iter_mut() {
            match pool.release(subnet) {
                Ok(()) => {
                    debug!(self.log, "released subnet"; "subnet" => %subnet);
                    return Ok(());
                }
                Err(error) => {
                    debug!(
                        self.log,
                        "subnet not released by pool";
                        "cidr" => %pool.cidr(),
                        "error" => %InlineErrorChain::new(&error),
                    );
                }
            }
        }
        Err(ReleaseError::NotFound(subnet))
    }
}
