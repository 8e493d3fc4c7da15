//! Builds the per-picture AFGS1 SEI message: parameter set selection, seed
//! modulation, buffer-based elision, and the ITU-T T.35 envelope.

use anyhow::{ensure, Result};
use num_rational::Rational64;

use crate::{
    afgs1::{
        buffer::ParamsBuffer,
        database::{presentation_time, GrainDatabase},
        params::FilmGrainParams,
        syntax::write_film_grain_param_sets,
    },
    bits::BitWriter,
};

/// ITU-T T.35 country code under which the AOM provider code is registered.
pub const ITU_T_T35_COUNTRY_CODE: u8 = 0xB5;
/// AOM provider code and provider-oriented code identifying AFGS1.
pub const AFGS1_PROVIDER_BYTES: [u8; 3] = [0x58, 0x90, 0x01];

/// `user_data_registered_itu_t_t35` SEI payload type.
pub const PAYLOAD_TYPE_USER_DATA_REGISTERED_ITU_T_T35: u8 = 4;

// Wire seeds live in 0..=65534; the modulus is deliberately 2^16 - 1.
const GRAIN_SEED_MODULUS: u64 = 65_535;

/// A user-data-registered SEI body as a plain
/// (country code, provider bytes, payload) triple.
///
/// Keeping this independent of any host bitstream library means the payload
/// generator composes with whatever NAL wrapper the host needs.
#[derive(Debug, Clone)]
pub struct UserDataRegistered {
    pub country_code: u8,
    pub provider_bytes: [u8; 3],
    pub payload: Vec<u8>,
}

/// Encodes one SEI message (payload type, ff-extended payload size, T.35
/// body) followed by the RBSP trailing bits. The result still needs NAL
/// encapsulation.
#[must_use]
pub fn encode_sei_message(message: &UserDataRegistered) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(message.payload.len() + 8);
    rbsp.push(PAYLOAD_TYPE_USER_DATA_REGISTERED_ITU_T_T35);
    let mut size = 1 + message.provider_bytes.len() + message.payload.len();
    while size >= 255 {
        rbsp.push(0xFF);
        size -= 255;
    }
    rbsp.push(size as u8);
    rbsp.push(message.country_code);
    rbsp.extend_from_slice(&message.provider_bytes);
    rbsp.extend_from_slice(&message.payload);
    rbsp.push(0x80); // rbsp_stop_one_bit plus alignment
    rbsp
}

/// The film grain parameter sets transmitted with one picture.
#[derive(Debug, Clone, Default)]
pub struct Afgs1Sei {
    param_sets: Vec<FilmGrainParams>,
    write_buffer: BitWriter,
}

impl Afgs1Sei {
    /// Collects the parameter sets active at `poc` and modulates their
    /// seeds. The database stores one constant seed per entry; each picture
    /// perturbs it by the picture order count so consecutive pictures do not
    /// synthesize identical grain.
    #[must_use]
    pub fn from_database(database: &GrainDatabase, poc: u64, frame_rate: Rational64) -> Self {
        let mut param_sets = database.find_frames(presentation_time(poc, frame_rate));
        for params in &mut param_sets {
            params.grain_seed =
                ((u64::from(params.grain_seed) + poc) % GRAIN_SEED_MODULUS) as u16;
        }
        Self {
            param_sets,
            write_buffer: BitWriter::new(),
        }
    }

    /// As [`Self::from_database`], but additionally replays the decoder
    /// buffer: a set the decoder already holds is re-pointed at its slot and
    /// sent with `update_parameters` cleared, eliding its body.
    pub fn with_buffer(
        database: &GrainDatabase,
        poc: u64,
        frame_rate: Rational64,
        buffer: &ParamsBuffer,
    ) -> Result<Self> {
        let mut sei = Self::from_database(database, poc, frame_rate);
        for params in &mut sei.param_sets {
            if let Some(index) = buffer.find(params) {
                params.film_grain_param_set_idx = index as u8;
                params.update_parameters = false;
            } else if params.apply_grain && !params.update_parameters {
                // The table asked the decoder to reuse a set it was never
                // given.
                ensure!(
                    buffer
                        .get(usize::from(params.film_grain_param_set_idx))
                        .is_some(),
                    "Non-updating parameter set references slot {} which holds no parameters",
                    params.film_grain_param_set_idx
                );
            }
        }
        Ok(sei)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.param_sets.is_empty()
    }

    /// Stores the transmitted sets into the emulated decoder buffer. Call
    /// after the message for this picture has been written out.
    pub fn update_buffer(&self, buffer: &mut ParamsBuffer) {
        for params in &self.param_sets {
            buffer.update(params);
        }
    }

    /// Serializes the parameter sets into a T.35 user data message.
    pub fn to_t35(&mut self) -> Result<UserDataRegistered> {
        write_film_grain_param_sets(&self.param_sets, &mut self.write_buffer)?;
        let message = UserDataRegistered {
            country_code: ITU_T_T35_COUNTRY_CODE,
            provider_bytes: AFGS1_PROVIDER_BYTES,
            payload: self.write_buffer.as_bytes().to_vec(),
        };
        self.write_buffer.clear();
        Ok(message)
    }
}
