/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::{
    fmt::{self, Debug, Display, Formatter},
    hash::Hash,
    ops::{Add, AddAssign, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

use borsh::{BorshDeserialize, BorshSerialize};
use num_bigint::BigUint;

/// Height of a composite block in the chain. Starts at 1 for the genesis block and increases
/// by 1 for every subsequent block connected by a `previous_hash` link.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct BlockHeight(u64);

impl BlockHeight {
    /// Create a new `BlockHeight` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The height of the genesis block, which is 1.
    pub const fn genesis() -> Self {
        Self(1)
    }

    /// Get the inner `u64` value of this `BlockHeight`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl AddAssign<u64> for BlockHeight {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Add<u64> for BlockHeight {
    type Output = BlockHeight;
    fn add(self, rhs: u64) -> Self::Output {
        BlockHeight::new(self.0.add(rhs))
    }
}

impl Sub<BlockHeight> for BlockHeight {
    type Output = u64;
    fn sub(self, rhs: BlockHeight) -> Self::Output {
        self.0 - rhs.0
    }
}

/// 32-byte cryptographic hash identifying a composite block.
///
/// Within this crate, `BlockHash`-es are always SHA256 hashes produced by
/// [`CompositeBlock::compute_hash`](super::block::CompositeBlock::compute_hash). Child-chain
/// header hashes are opaque strings and are *not* represented by this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Create a new `BlockHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The all-zero hash used as the `previous_hash` of the genesis block.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Get the inner `[u8; 32]` value of this `BlockHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for BlockHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for BlockHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A point in time as a number of seconds since the Unix Epoch.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new `Timestamp` with an `int` inner value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock is set before the Unix Epoch")
                .as_secs(),
        )
    }

    /// Get the inner `u64` value of this `Timestamp`.
    pub const fn int(&self) -> u64 {
        self.0
    }

    /// The absolute difference, in seconds, between this timestamp and `other`.
    pub fn abs_diff(&self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: u64) -> Self::Output {
        Timestamp::new(self.0.add(rhs))
    }
}

impl Sub<u64> for Timestamp {
    type Output = Timestamp;
    fn sub(self, rhs: u64) -> Self::Output {
        Timestamp::new(self.0.saturating_sub(rhs))
    }
}

/// Arbitrary-precision non-negative integer used for `difficulty`, `distance` and
/// `total_distance`.
///
/// Serialized as the little-endian magnitude bytes of the inner value, so the encoding of a
/// given quantity is unique and round-trips exactly.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Distance(BigUint);

impl Distance {
    /// Create a new `Distance` wrapping `int`.
    pub fn new(int: BigUint) -> Self {
        Self(int)
    }

    /// Create a `Distance` from a `u64` quantity.
    pub fn from_u64(int: u64) -> Self {
        Self(BigUint::from(int))
    }

    /// The zero quantity.
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    /// Whether this quantity is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// Get a reference to the inner [`BigUint`] of this `Distance`.
    pub const fn int(&self) -> &BigUint {
        &self.0
    }
}

impl Add<&Distance> for &Distance {
    type Output = Distance;
    fn add(self, rhs: &Distance) -> Distance {
        Distance(&self.0 + &rhs.0)
    }
}

impl Display for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl BorshSerialize for Distance {
    fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.to_bytes_le().serialize(writer)
    }
}

impl BorshDeserialize for Distance {
    fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
        let bytes = Vec::<u8>::deserialize_reader(reader)?;
        Ok(Distance(BigUint::from_bytes_le(&bytes)))
    }
}

/// Name of an external child blockchain (e.g. `"btc"`, `"eth"`).
///
/// `ChainName` is `Ord` so that the header mapping inside a composite block has a
/// deterministic serialization order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ChainName(String);

impl ChainName {
    /// Create a new `ChainName` wrapping `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the inner `str` of this `ChainName`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChainName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for ChainName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Identity credited for mining a composite block. Opaque to the core.
#[derive(Clone, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize, Default)]
pub struct MinerKey(String);

impl MinerKey {
    /// Create a new `MinerKey` wrapping `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the inner `str` of this `MinerKey`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key is the empty string.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for MinerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Display for MinerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Identity of a peer on the overlay: a base58-encoded public key.
#[derive(Clone, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct PeerId(String);

impl PeerId {
    /// Parse `id` as a base58 string. Returns `None` if `id` contains characters outside the
    /// base58 alphabet.
    pub fn parse(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if bs58::decode(&id).into_vec().is_ok() {
            Some(Self(id))
        } else {
            None
        }
    }

    /// Get the inner `str` of this `PeerId`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier the overlay transport assigns to one live connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new `ConnectionId` wrapping `int`.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the inner `u64` value of this `ConnectionId`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of one outbound request on a worker channel, of the form
/// `"{pid}@{hex(random_128_bit)}"`.
#[derive(Clone, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct MsgId(String);

impl MsgId {
    /// Generate a fresh `MsgId` for a request to the worker with the given `pid`.
    pub fn generate(pid: u32) -> Self {
        let nonce: u128 = rand::random();
        Self(format!("{}@{:032x}", pid, nonce))
    }

    /// Get the inner `str` of this `MsgId`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pid component of this `MsgId`, if well-formed.
    pub fn pid(&self) -> Option<u32> {
        self.0.split('@').next()?.parse().ok()
    }
}

impl Display for MsgId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl Debug for MsgId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_borsh_round_trip() {
        let d = Distance::new(
            BigUint::parse_bytes(b"340282366920938463463374607431768211456", 10).unwrap(),
        );
        let bytes = d.try_to_vec().unwrap();
        let back = Distance::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn distance_ordering() {
        assert!(Distance::from_u64(100) < Distance::from_u64(110));
        assert!(Distance::zero().is_zero());
    }

    #[test]
    fn peer_id_rejects_non_base58() {
        assert!(PeerId::parse("QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG").is_some());
        assert!(PeerId::parse("not base58: 0OIl").is_none());
    }

    #[test]
    fn msg_id_embeds_pid() {
        let id = MsgId::generate(4217);
        assert_eq!(id.pid(), Some(4217));
    }
}
