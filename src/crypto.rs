use std::path::{Path, PathBuf};

use aes::Aes128;
use cbc::cipher::{generic_array::GenericArray, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{Result, SegmenterError};

/// CBCS sample encryption pattern: 1 encrypted 16-byte block followed by 9
/// skipped blocks (spec §5 "Sample-level encryption specifics").
pub const CBCS_ENCRYPT_BLOCKS: usize = 1;
pub const CBCS_SKIP_BLOCKS: usize = 9;
pub const AES_BLOCK_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;

/// Key material for one rotation period. `fragments_per_key` segments share
/// one `key_rotation_id` and reference the same files on disk.
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub rotation_id: u64,
    pub key: [u8; 16],
    pub iv: [u8; 16],
    /// Only populated for fMP4/CBCS; `None` for plain TS AES-128.
    pub kid: Option<[u8; 16]>,
    pub const_iv: Option<Vec<u8>>,
}

impl KeyMaterial {
    /// Draw fresh key/iv (and kid/const_iv for fMP4) from the OS RNG.
    pub fn generate(rotation_id: u64, fmp4: bool, const_iv_len: usize) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; 16];
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);

        let (kid, const_iv) = if fmp4 {
            if const_iv_len != 8 && const_iv_len != 16 {
                return Err(SegmenterError::CryptoRng(format!(
                    "const_iv length must be 8 or 16, got {const_iv_len}"
                )));
            }
            let mut kid = [0u8; 16];
            rng.fill_bytes(&mut kid);
            let mut const_iv = vec![0u8; const_iv_len];
            rng.fill_bytes(&mut const_iv);
            (Some(kid), Some(const_iv))
        } else {
            (None, None)
        };

        Ok(KeyMaterial {
            rotation_id,
            key,
            iv,
            kid,
            const_iv,
        })
    }

    /// Write the raw 16-byte key to `<key_path>/<key_file>`, atomically via
    /// a `.temp` sibling + rename (mirrors the playlist write contract).
    pub fn write_key_file(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("temp");
        std::fs::write(&tmp, self.key).map_err(|e| SegmenterError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| SegmenterError::io(path, e))?;
        Ok(())
    }

    pub fn iv_hex(&self) -> String {
        hex::encode(self.iv)
    }
}

/// Encrypt a whole TS segment buffer with AES-128-CBC, PKCS7-padded, for the
/// `AES-128` playlist method. Used once per segment close, never per-packet.
pub fn encrypt_ts_segment(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    let enc = Aes128CbcEnc::new(key.into(), iv.into());
    enc.encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(plaintext)
}

/// Apply CBCS 1-encrypt/9-skip to one sample's payload in place, advancing
/// `iv` for the next sample per block count consumed (spec §4.2 fMP4).
///
/// `kid` selects the key externally (this function receives the resolved
/// key directly); only the pattern + IV-chaining behavior lives here.
pub fn encrypt_cbcs_sample(key: &[u8; 16], iv: &mut [u8; 16], sample: &mut [u8]) {
    let mut offset = 0;
    while offset + AES_BLOCK_SIZE <= sample.len() {
        let mut enc = Aes128CbcEnc::new(key.into(), (*iv).into());
        let mut block = GenericArray::clone_from_slice(&sample[offset..offset + AES_BLOCK_SIZE]);
        enc.encrypt_block_mut(&mut block);
        sample[offset..offset + AES_BLOCK_SIZE].copy_from_slice(&block);
        iv.copy_from_slice(&block);
        offset += AES_BLOCK_SIZE;
        offset += (CBCS_SKIP_BLOCKS * AES_BLOCK_SIZE).min(sample.len().saturating_sub(offset));
    }
}

/// Renders `hls_key_file`/`hls_key_file_path` templates for one rotation,
/// mirroring the filename templating rules used for segments/playlists.
pub fn key_file_path(key_path_template: &str, key_file_template: &str, rotation_id: u64) -> PathBuf {
    let rendered = key_file_template.replace("[seq]", &rotation_id.to_string());
    Path::new(key_path_template).join(rendered)
}
