// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection ID generation and stateless reset token bookkeeping

use aes::{
    cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit},
    Aes128, Block,
};
use dashmap::DashMap;
use rand::Rng;
use tern_quic_core::{
    connection,
    stateless_reset::{self, Token, TOKEN_LEN},
};

fn encrypt(cipher: &Aes128, bytes: &[u8]) -> [u8; TOKEN_LEN] {
    // CBC-MAC over zero padded blocks; the inputs of one key all have the same length
    let mut block = Block::default();
    for chunk in bytes.chunks(TOKEN_LEN) {
        for (byte, input) in block.iter_mut().zip(chunk) {
            *byte ^= *input;
        }
        cipher.encrypt_block(&mut block);
    }
    let mut out = [0u8; TOKEN_LEN];
    out.copy_from_slice(&block);
    out
}

/// Issues connection IDs and derives the stateless reset token of each from a secret key.
///
/// Tokens are a function of the ID, so a reset can still be produced for an ID after the
/// connection state is gone.
pub struct IdFactory {
    len: usize,
    cipher: Aes128,
}

impl core::fmt::Debug for IdFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdFactory").field("len", &self.len).finish()
    }
}

impl IdFactory {
    /// A factory with a random key issuing IDs of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::with_key(len, rand::random())
    }

    pub fn with_key(len: usize, key: [u8; 16]) -> Self {
        Self {
            len: len.min(connection::MAX_LEN),
            cipher: Aes128::new(&GenericArray::from(key)),
        }
    }

    #[inline]
    pub fn id_len(&self) -> usize {
        self.len
    }

    /// Returns a random ID and its reset token
    pub fn generate(&self) -> (connection::Id, Token) {
        let mut bytes = [0u8; connection::MAX_LEN];
        rand::rng().fill(&mut bytes[..self.len]);
        let id = connection::Id::try_from_bytes(&bytes[..self.len])
            .unwrap_or(connection::Id::EMPTY);
        let token = Token::from(encrypt(&self.cipher, id.as_bytes()));
        (id, token)
    }

    /// Returns the reset token of an ID this factory could have issued
    pub fn reset_token(&self, id: &connection::Id) -> Option<Token> {
        if id.len() != self.len || id.is_empty() {
            return None;
        }
        Some(Token::from(encrypt(&self.cipher, id.as_bytes())))
    }
}

/// Maps tokens received from peers to the entity they reset.
///
/// Keys are the tokens encrypted under a local secret so the hash lookup does not leak
/// timing information about the stored tokens.
pub(crate) struct ResetTokenTable<T> {
    cipher: Aes128,
    entries: DashMap<[u8; TOKEN_LEN], T>,
}

impl<T> core::fmt::Debug for ResetTokenTable<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResetTokenTable")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<T: Clone> ResetTokenTable<T> {
    pub fn new() -> Self {
        Self {
            cipher: Aes128::new(&GenericArray::from(rand::random::<[u8; 16]>())),
            entries: DashMap::new(),
        }
    }

    #[inline]
    fn key(&self, token: &Token) -> [u8; TOKEN_LEN] {
        encrypt(&self.cipher, token.as_ref())
    }

    pub fn insert(&self, token: Token, value: T) {
        self.entries.insert(self.key(&token), value);
    }

    pub fn remove(&self, token: &Token) -> Option<T> {
        self.entries.remove(&self.key(token)).map(|(_, value)| value)
    }

    /// Returns the entry registered for the trailing token of `datagram`
    pub fn match_datagram(&self, datagram: &[u8]) -> Option<T> {
        let token = stateless_reset::trailing_token(datagram)?;
        self.entries
            .get(&self.key(&token))
            .map(|entry| entry.value().clone())
    }

    /// Removes the entry of `token` if `f` accepts its value
    pub fn remove_if(&self, token: &Token, f: impl FnOnce(&T) -> bool) -> Option<T> {
        self.entries
            .remove_if(&self.key(token), |_, value| f(value))
            .map(|(_, value)| value)
    }

    pub fn clear(&self) {
        self.entries.clear()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_quic_core::stateless_reset::MIN_PACKET_LEN;

    #[test]
    fn generated_ids_carry_their_token() {
        let factory = IdFactory::with_key(8, [7; 16]);
        let (id, token) = factory.generate();
        assert_eq!(id.len(), 8);
        assert_eq!(factory.reset_token(&id), Some(token));

        let (other, other_token) = factory.generate();
        assert_ne!(id, other);
        assert_ne!(token, other_token);

        // the token only depends on the key and the ID
        let same_key = IdFactory::with_key(8, [7; 16]);
        assert_eq!(same_key.reset_token(&id), Some(token));
        let other_key = IdFactory::with_key(8, [8; 16]);
        assert_ne!(other_key.reset_token(&id), Some(token));
    }

    #[test]
    fn foreign_ids_have_no_token() {
        let factory = IdFactory::new(8);
        let short = connection::Id::try_from_bytes(&[1; 4]).unwrap();
        assert_eq!(factory.reset_token(&short), None);
        assert_eq!(factory.reset_token(&connection::Id::EMPTY), None);
    }

    #[test]
    fn long_ids_use_every_byte() {
        let factory = IdFactory::with_key(20, [3; 16]);
        let a = connection::Id::try_from_bytes(&[1; 20]).unwrap();
        let mut bytes = [1; 20];
        bytes[19] = 2;
        let b = connection::Id::try_from_bytes(&bytes).unwrap();
        assert_ne!(factory.reset_token(&a), factory.reset_token(&b));
    }

    fn table() -> (ResetTokenTable<u32>, Token) {
        let table = ResetTokenTable::new();
        let token = Token::from([0x42; TOKEN_LEN]);
        table.insert(token, 7);
        (table, token)
    }

    #[test]
    fn registered_trailing_token_matches() {
        let (table, token) = table();
        let mut datagram = vec![0x40, 1, 2, 3, 4];
        datagram.extend_from_slice(token.as_ref());
        assert_eq!(datagram.len(), MIN_PACKET_LEN);
        assert_eq!(table.match_datagram(&datagram), Some(7));

        // one byte too short to be a reset
        assert_eq!(table.match_datagram(&datagram[1..]), None);

        assert_eq!(table.remove(&token), Some(7));
        assert_eq!(table.match_datagram(&datagram), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn altered_token_never_matches() {
        let (table, token) = table();
        let table = std::panic::AssertUnwindSafe(table);
        bolero::check!()
            .with_type::<(u8, u8, [u8; 5])>()
            .for_each(|(index, flip, prefix)| {
                let mut datagram = prefix.to_vec();
                datagram.extend_from_slice(token.as_ref());
                assert_eq!(datagram.len(), MIN_PACKET_LEN);
                // the prefix never matters
                assert_eq!(table.match_datagram(&datagram), Some(7));

                if *flip == 0 {
                    return;
                }
                let index = prefix.len() + (*index as usize % TOKEN_LEN);
                datagram[index] ^= flip;
                assert_eq!(table.match_datagram(&datagram), None);
            });
    }

    #[test]
    fn remove_if_checks_value() {
        let (table, token) = table();
        assert_eq!(table.remove_if(&token, |value| *value == 9), None);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove_if(&Token::ZEROED, |_| true), None);
        assert_eq!(table.remove_if(&token, |value| *value == 7), Some(7));
        assert_eq!(table.len(), 0);
    }
}
