//! Secure element: key storage and the cryptographic primitives the MAC
//! engine needs for frame integrity and key derivation.
//!
//! [`SecureElement`] is the capability interface handed to the engine.
//! [`SoftSecureElement`] is a software implementation holding keys in RAM
//! and computing AES-CMAC / AES-ECB on the CPU; deployments with dedicated
//! secure hardware implement the trait against it instead.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::Cmac;
use rand_core::RngCore;

pub const KEY_SIZE: usize = 16;
pub const EUI_SIZE: usize = 8;

const AES_BLOCK_SIZE: usize = 16;
const NUM_KEYS: usize = 24;
const NUM_MC_KEYS: usize = 24;

/// First identifier of the multicast key range; kept disjoint from the
/// unicast identifiers.
const MC_KEY_BASE: usize = 128;

const ZERO_KEY: [u8; KEY_SIZE] = [0; KEY_SIZE];

/// Identifiers for keys resident in the secure element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[repr(u8)]
pub enum KeyId {
    AppKey = 0,
    NwkKey = 1,
    JSIntKey = 2,
    JSEncKey = 3,
    FNwkSIntKey = 4,
    SNwkSIntKey = 5,
    NwkSEncKey = 6,
    AppSKey = 7,
    McRootKey = 8,
    McKeKey = 9,
    McAppSKey0 = 128,
    McNwkSKey0 = 129,
    McAppSKey1 = 130,
    McNwkSKey1 = 131,
    McAppSKey2 = 132,
    McNwkSKey2 = 133,
    McAppSKey3 = 134,
    McNwkSKey3 = 135,
    /// Reserved all-zero key. Readable, never writable.
    ZeroKey = 255,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SeError {
    InvalidKeyId,
    /// Input not a multiple of the AES block size, or output too short.
    BufferSize,
    CmacMismatch,
    /// EUI slot is write-protected.
    ReadOnly,
}

/// Cryptographic capabilities exposed to the MAC engine.
pub trait SecureElement {
    fn set_key(&mut self, id: KeyId, key: [u8; KEY_SIZE]) -> Result<(), SeError>;

    /// AES-CMAC over an optional 16-byte prefix block followed by `buf`,
    /// returning the first four tag bytes little-endian — the form frame
    /// MICs are carried in.
    fn compute_aes_cmac(
        &self,
        prefix: Option<&[u8; AES_BLOCK_SIZE]>,
        buf: &[u8],
        id: KeyId,
    ) -> Result<u32, SeError>;

    fn verify_aes_cmac(&self, buf: &[u8], expected: u32, id: KeyId) -> Result<(), SeError>;

    /// AES-ECB encryption of a block-aligned input.
    fn aes_encrypt(&self, input: &[u8], id: KeyId, output: &mut [u8]) -> Result<(), SeError>;

    /// Encrypt `input` under `root` and store the result as `target`.
    fn derive_and_store(
        &mut self,
        input: &[u8; KEY_SIZE],
        root: KeyId,
        target: KeyId,
    ) -> Result<(), SeError>;

    /// Cryptographically secure random value for nonces.
    fn random(&mut self) -> u32;

    fn dev_eui(&self) -> &[u8; EUI_SIZE];
    fn set_dev_eui(&mut self, eui: [u8; EUI_SIZE]) -> Result<(), SeError>;
    fn join_eui(&self) -> &[u8; EUI_SIZE];
    fn set_join_eui(&mut self, eui: [u8; EUI_SIZE]) -> Result<(), SeError>;
}

/// Software secure element backed by a caller-supplied RNG.
pub struct SoftSecureElement<G: RngCore> {
    rng: G,
    dev_eui: [u8; EUI_SIZE],
    join_eui: [u8; EUI_SIZE],
    dev_eui_locked: bool,
    join_eui_locked: bool,
    keys: [[u8; KEY_SIZE]; NUM_KEYS],
    mc_keys: [[u8; KEY_SIZE]; NUM_MC_KEYS],
}

impl<G: RngCore> SoftSecureElement<G> {
    pub fn new(rng: G) -> Self {
        Self {
            rng,
            dev_eui: [0; EUI_SIZE],
            join_eui: [0; EUI_SIZE],
            dev_eui_locked: false,
            join_eui_locked: false,
            keys: [[0; KEY_SIZE]; NUM_KEYS],
            mc_keys: [[0; KEY_SIZE]; NUM_MC_KEYS],
        }
    }

    /// Reject further device EUI writes. Typically called once after
    /// factory provisioning.
    pub fn lock_dev_eui(&mut self) {
        self.dev_eui_locked = true;
    }

    /// Reject further join EUI writes.
    pub fn lock_join_eui(&mut self) {
        self.join_eui_locked = true;
    }

    fn key_bytes(&self, id: KeyId) -> &[u8; KEY_SIZE] {
        match id {
            KeyId::ZeroKey => &ZERO_KEY,
            _ => {
                let kid = id as usize;
                if kid < NUM_KEYS {
                    &self.keys[kid]
                } else {
                    &self.mc_keys[kid - MC_KEY_BASE]
                }
            }
        }
    }

    fn cmac(&self, prefix: Option<&[u8; AES_BLOCK_SIZE]>, buf: &[u8], id: KeyId) -> [u8; 16] {
        let mut mac = Cmac::<Aes128>::new(GenericArray::from_slice(self.key_bytes(id)));
        if let Some(prefix) = prefix {
            cmac::Mac::update(&mut mac, prefix);
        }
        cmac::Mac::update(&mut mac, buf);
        cmac::Mac::finalize(mac).into_bytes().into()
    }
}

impl<G: RngCore> SecureElement for SoftSecureElement<G> {
    fn set_key(&mut self, id: KeyId, key: [u8; KEY_SIZE]) -> Result<(), SeError> {
        debug!("setting key {}", id as u8);
        match id {
            KeyId::ZeroKey => Err(SeError::InvalidKeyId),
            _ => {
                let kid = id as usize;
                if kid < NUM_KEYS {
                    self.keys[kid] = key;
                } else {
                    self.mc_keys[kid - MC_KEY_BASE] = key;
                }
                Ok(())
            }
        }
    }

    fn compute_aes_cmac(
        &self,
        prefix: Option<&[u8; AES_BLOCK_SIZE]>,
        buf: &[u8],
        id: KeyId,
    ) -> Result<u32, SeError> {
        let tag = self.cmac(prefix, buf, id);
        Ok(u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]))
    }

    fn verify_aes_cmac(&self, buf: &[u8], expected: u32, id: KeyId) -> Result<(), SeError> {
        let computed = self.compute_aes_cmac(None, buf, id)?;
        if computed != expected {
            return Err(SeError::CmacMismatch);
        }
        Ok(())
    }

    fn aes_encrypt(&self, input: &[u8], id: KeyId, output: &mut [u8]) -> Result<(), SeError> {
        if input.len() % AES_BLOCK_SIZE != 0 || output.len() < input.len() {
            return Err(SeError::BufferSize);
        }

        let cipher = Aes128::new(GenericArray::from_slice(self.key_bytes(id)));
        for (chunk, out) in input.chunks(AES_BLOCK_SIZE).zip(output.chunks_mut(AES_BLOCK_SIZE)) {
            let mut block = GenericArray::clone_from_slice(chunk);
            cipher.encrypt_block(&mut block);
            out.copy_from_slice(&block);
        }
        Ok(())
    }

    fn derive_and_store(
        &mut self,
        input: &[u8; KEY_SIZE],
        root: KeyId,
        target: KeyId,
    ) -> Result<(), SeError> {
        debug!("deriving key {} from {}", target as u8, root as u8);
        let mut key = [0u8; KEY_SIZE];
        self.aes_encrypt(input, root, &mut key)?;
        self.set_key(target, key)
    }

    fn random(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn dev_eui(&self) -> &[u8; EUI_SIZE] {
        &self.dev_eui
    }

    fn set_dev_eui(&mut self, eui: [u8; EUI_SIZE]) -> Result<(), SeError> {
        if self.dev_eui_locked {
            error!("attempt to change write-protected device EUI");
            return Err(SeError::ReadOnly);
        }
        self.dev_eui = eui;
        Ok(())
    }

    fn join_eui(&self) -> &[u8; EUI_SIZE] {
        &self.join_eui
    }

    fn set_join_eui(&mut self, eui: [u8; EUI_SIZE]) -> Result<(), SeError> {
        if self.join_eui_locked {
            error!("attempt to change write-protected join EUI");
            return Err(SeError::ReadOnly);
        }
        self.join_eui = eui;
        Ok(())
    }
}
