use bytes::Bytes;

use crate::error::ProtocolError;

/// Fixed header: 4-byte magic, 4-byte type, 4-byte body size (big endian).
pub const HEADER_LEN: usize = 12;

/// Who sent the packet: `\0REQ` from clients and workers, `\0RES` from the
/// job server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub const fn bytes(self) -> &'static [u8; 4] {
        match self {
            Magic::Request => b"\0REQ",
            Magic::Response => b"\0RES",
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw {
            b"\0REQ" => Some(Magic::Request),
            b"\0RES" => Some(Magic::Response),
            _ => None,
        }
    }
}

/// Gearman packet types this crate speaks. Values are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    CanDo = 1,
    CantDo = 2,
    ResetAbilities = 3,
    PreSleep = 4,
    Noop = 6,
    SubmitJob = 7,
    JobCreated = 8,
    GrabJob = 9,
    NoJob = 10,
    JobAssign = 11,
    WorkStatus = 12,
    WorkComplete = 13,
    WorkFail = 14,
    EchoReq = 16,
    EchoRes = 17,
    SubmitJobBg = 18,
    Error = 19,
    SubmitJobHigh = 21,
    SetClientId = 22,
    WorkException = 25,
    OptionReq = 26,
    OptionRes = 27,
    WorkData = 28,
    WorkWarning = 29,
    SubmitJobHighBg = 32,
    SubmitJobLow = 33,
    SubmitJobLowBg = 34,
}

impl PacketType {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use PacketType::*;
        Some(match code {
            1 => CanDo,
            2 => CantDo,
            3 => ResetAbilities,
            4 => PreSleep,
            6 => Noop,
            7 => SubmitJob,
            8 => JobCreated,
            9 => GrabJob,
            10 => NoJob,
            11 => JobAssign,
            12 => WorkStatus,
            13 => WorkComplete,
            14 => WorkFail,
            16 => EchoReq,
            17 => EchoRes,
            18 => SubmitJobBg,
            19 => Error,
            21 => SubmitJobHigh,
            22 => SetClientId,
            25 => WorkException,
            26 => OptionReq,
            27 => OptionRes,
            28 => WorkData,
            29 => WorkWarning,
            32 => SubmitJobHighBg,
            33 => SubmitJobLow,
            34 => SubmitJobLowBg,
            _ => return None,
        })
    }

    /// Number of NUL-separated arguments in the body. The last argument is
    /// opaque and may itself contain NUL bytes.
    pub const fn arity(self) -> usize {
        use PacketType::*;
        match self {
            ResetAbilities | PreSleep | Noop | GrabJob | NoJob => 0,
            CanDo | CantDo | JobCreated | WorkFail | EchoReq | EchoRes | SetClientId
            | OptionReq | OptionRes => 1,
            WorkComplete | WorkException | WorkData | WorkWarning | Error => 2,
            SubmitJob | SubmitJobBg | SubmitJobHigh | SubmitJobHighBg | SubmitJobLow
            | SubmitJobLowBg | JobAssign | WorkStatus => 3,
        }
    }

    pub const fn is_submit(self) -> bool {
        matches!(
            self,
            PacketType::SubmitJob
                | PacketType::SubmitJobBg
                | PacketType::SubmitJobHigh
                | PacketType::SubmitJobHighBg
                | PacketType::SubmitJobLow
                | PacketType::SubmitJobLowBg
        )
    }
}

/// One framed Gearman message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub magic: Magic,
    pub kind: PacketType,
    pub args: Vec<Bytes>,
}

impl Packet {
    pub fn request(kind: PacketType, args: Vec<Bytes>) -> Self {
        Self {
            magic: Magic::Request,
            kind,
            args,
        }
    }

    pub fn response(kind: PacketType, args: Vec<Bytes>) -> Self {
        Self {
            magic: Magic::Response,
            kind,
            args,
        }
    }

    pub fn submit(
        kind: PacketType,
        function: &str,
        unique: &str,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::request(
            kind,
            vec![
                Bytes::copy_from_slice(function.as_bytes()),
                Bytes::copy_from_slice(unique.as_bytes()),
                data.into(),
            ],
        )
    }

    pub fn can_do(function: &str) -> Self {
        Self::request(
            PacketType::CanDo,
            vec![Bytes::copy_from_slice(function.as_bytes())],
        )
    }

    pub fn grab_job() -> Self {
        Self::request(PacketType::GrabJob, Vec::new())
    }

    pub fn pre_sleep() -> Self {
        Self::request(PacketType::PreSleep, Vec::new())
    }

    pub fn work_complete(handle: &Bytes, data: impl Into<Bytes>) -> Self {
        Self::request(PacketType::WorkComplete, vec![handle.clone(), data.into()])
    }

    pub fn work_fail(handle: &Bytes) -> Self {
        Self::request(PacketType::WorkFail, vec![handle.clone()])
    }

    pub fn work_exception(handle: &Bytes, message: &str) -> Self {
        Self::request(
            PacketType::WorkException,
            vec![handle.clone(), Bytes::copy_from_slice(message.as_bytes())],
        )
    }

    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    /// Argument `index` as UTF-8 text (function names, handles, error codes).
    pub fn arg_str(&self, index: usize) -> Result<&str, ProtocolError> {
        let raw = self.args.get(index).ok_or(ProtocolError::MissingArgument {
            kind: self.kind,
            expected: self.kind.arity(),
            found: self.args.len(),
        })?;
        std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8 {
            kind: self.kind,
            index,
        })
    }

    pub fn body_len(&self) -> usize {
        let separators = self.args.len().saturating_sub(1);
        self.args.iter().map(Bytes::len).sum::<usize>() + separators
    }

    /// Check arity and that only the last argument carries NUL bytes.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let expected = self.kind.arity();
        if self.args.len() != expected {
            return Err(ProtocolError::Arity {
                kind: self.kind,
                expected,
                found: self.args.len(),
            });
        }
        let last = self.args.len().saturating_sub(1);
        if let Some(index) = self.args[..last].iter().position(|a| a.contains(&0)) {
            return Err(ProtocolError::EmbeddedNul {
                kind: self.kind,
                index,
            });
        }
        Ok(())
    }
}
