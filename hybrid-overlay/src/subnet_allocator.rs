// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Allocation of fixed-size host subnets out of a single IPv4 CIDR

use ipnetwork::IpNetwork;
use ipnetwork::IpNetworkError;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Upper bound on the number of subnet bits, which bounds the size of the
/// allocation bitmap at 2 MiB.
pub const MAX_SUBNET_BITS: u8 = 24;

#[derive(Debug, thiserror::Error)]
pub enum SubnetAllocatorError {
    #[error("no subnets available in {0}")]
    Full(Ipv4Network),

    #[error("invalid cluster CIDR {cidr}")]
    InvalidCidr {
        cidr: Ipv4Network,
        #[source]
        err: IpNetworkError,
    },

    #[error("host subnet length {host_subnet_length} is invalid for {cidr}")]
    InvalidHostSubnetLength { cidr: Ipv4Network, host_subnet_length: u8 },

    #[error(
        "{cidr} would be split into more than 2^{MAX_SUBNET_BITS} \
         subnets of length {host_subnet_length}"
    )]
    TooManySubnets { cidr: Ipv4Network, host_subnet_length: u8 },

    #[error("{subnet} is not a /{host_subnet_length} subnet of {cidr}")]
    NotASubnet { cidr: Ipv4Network, host_subnet_length: u8, subnet: IpNetwork },

    #[error("{subnet} is not allocated from {cidr}")]
    NotAllocated { cidr: Ipv4Network, subnet: IpNetwork },

    #[error("failed to construct subnet {index} of {cidr}")]
    InvalidSubnet {
        cidr: Ipv4Network,
        index: u32,
        #[source]
        err: IpNetworkError,
    },
}

/// A source of host subnets.
///
/// A pool owns every subnet it hands out until that subnet is released back
/// to it.
pub trait SubnetPool: Send + std::fmt::Debug {
    /// The range this pool allocates from.
    fn cidr(&self) -> Ipv4Network;

    /// Take an unused subnet. Returns [`SubnetAllocatorError::Full`] when
    /// none remain.
    fn allocate(&mut self) -> Result<Ipv4Network, SubnetAllocatorError>;

    /// Return a subnet previously handed out by [`SubnetPool::allocate`].
    fn release(
        &mut self,
        subnet: IpNetwork,
    ) -> Result<(), SubnetAllocatorError>;
}

/// Hands out the `host_subnet_length` subnets of `cidr`, lowest free subnet
/// first.
#[derive(Debug)]
pub struct SubnetAllocator {
    cidr: Ipv4Network,
    host_subnet_length: u8,
    count: u32,
    allocated: u32,
    // One bit per subnet, set while the subnet is in use.
    bitmap: Vec<u64>,
}

impl SubnetAllocator {
    /// Create an allocator with every subnet in `in_use` already taken.
    pub fn new(
        cidr: Ipv4Network,
        host_subnet_length: u8,
        in_use: &[Ipv4Network],
    ) -> Result<Self, SubnetAllocatorError> {
        let cidr = Ipv4Network::new(cidr.network(), cidr.prefix())
            .map_err(|err| SubnetAllocatorError::InvalidCidr { cidr, err })?;
        if host_subnet_length < cidr.prefix() || host_subnet_length > 32 {
            return Err(SubnetAllocatorError::InvalidHostSubnetLength {
                cidr,
                host_subnet_length,
            });
        }
        let subnet_bits = host_subnet_length - cidr.prefix();
        if subnet_bits > MAX_SUBNET_BITS {
            return Err(SubnetAllocatorError::TooManySubnets {
                cidr,
                host_subnet_length,
            });
        }

        let count = 1u32 << subnet_bits;
        let words = (count as usize).div_ceil(64);
        let mut allocator = Self {
            cidr,
            host_subnet_length,
            count,
            allocated: 0,
            bitmap: vec![0; words],
        };
        for subnet in in_use {
            let index = allocator.index_of(IpNetwork::V4(*subnet))?;
            if !allocator.is_set(index) {
                allocator.set(index, true);
            }
        }
        Ok(allocator)
    }

    pub fn host_subnet_length(&self) -> u8 {
        self.host_subnet_length
    }

    /// Total number of subnets in this allocator.
    pub fn capacity(&self) -> u32 {
        self.count
    }

    /// Number of subnets currently in use.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    fn host_bits(&self) -> u32 {
        32 - u32::from(self.host_subnet_length)
    }

    fn index_of(&self, subnet: IpNetwork) -> Result<u32, SubnetAllocatorError> {
        let not_a_subnet = || SubnetAllocatorError::NotASubnet {
            cidr: self.cidr,
            host_subnet_length: self.host_subnet_length,
            subnet,
        };
        let IpNetwork::V4(v4) = subnet else {
            return Err(not_a_subnet());
        };
        if v4.prefix() != self.host_subnet_length
            || v4.ip() != v4.network()
            || !self.cidr.contains(v4.network())
        {
            return Err(not_a_subnet());
        }
        let offset = u32::from(v4.network()) - u32::from(self.cidr.network());
        Ok(offset.checked_shr(self.host_bits()).unwrap_or(0))
    }

    fn subnet_at(
        &self,
        index: u32,
    ) -> Result<Ipv4Network, SubnetAllocatorError> {
        let offset = index.checked_shl(self.host_bits()).unwrap_or(0);
        let base = Ipv4Addr::from(u32::from(self.cidr.network()) | offset);
        Ipv4Network::new(base, self.host_subnet_length).map_err(|err| {
            SubnetAllocatorError::InvalidSubnet { cidr: self.cidr, index, err }
        })
    }

    fn is_set(&self, index: u32) -> bool {
        let (word, bit) = (index as usize / 64, index % 64);
        self.bitmap[word] & (1u64 << bit) != 0
    }

    fn set(&mut self, index: u32, in_use: bool) {
        let (word, bit) = (index as usize / 64, index % 64);
        if in_use {
            self.bitmap[word] |= 1u64 << bit;
            self.allocated += 1;
        } else {
            self.bitmap[word] &= !(1u64 << bit);
            self.allocated -= 1;
        }
    }

    fn first_free(&self) -> Option<u32> {
        self.bitmap.iter().enumerate().find_map(|(word, bits)| {
            if *bits == u64::MAX {
                return None;
            }
            let index = u32::try_from(word * 64).ok()? + bits.trailing_ones();
            (index < self.count).then_some(index)
        })
    }
}

impl SubnetPool for SubnetAllocator {
    fn cidr(&self) -> Ipv4Network {
        self.cidr
    }

    fn allocate(&mut self) -> Result<Ipv4Network, SubnetAllocatorError> {
        let index =
            self.first_free().ok_or(SubnetAllocatorError::Full(self.cidr))?;
        let subnet = self.subnet_at(index)?;
        self.set(index, true);
        Ok(subnet)
    }

    fn release(
        &mut self,
        subnet: IpNetwork,
    ) -> Result<(), SubnetAllocatorError> {
        let index = self.index_of(subnet)?;
        if !self.is_set(index) {
            return Err(SubnetAllocatorError::NotAllocated {
                cidr: self.cidr,
                subnet,
            });
        }
        self.set(index, false);
        Ok(())
    }
}
