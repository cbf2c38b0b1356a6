//! Contract ABI
//!
//! Calldata encoding for the lottery and match contracts, return-value
//! decoding for their accessors, and event topics/payloads.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::{id, keccak256};

use super::{ContractCall, EventKind, EventName, LedgerError, ViewCall, ViewValue};

/// Solidity signature of a mutating call.
pub fn call_signature(call: &ContractCall) -> &'static str {
    match call {
        ContractCall::Register { .. } => "register(bytes32[])",
        ContractCall::RevealX { .. } => "revealX(uint256,uint256)",
        ContractCall::RevealY { .. } => "revealY(uint256,uint256)",
        ContractCall::TimeoutX => "timeoutX()",
        ContractCall::TimeoutY => "timeoutY()",
        ContractCall::TimeoutRegistration => "timeoutRegistration()",
        ContractCall::Refund => "refund()",
        ContractCall::GoForward => "goForward()",
    }
}

/// Solidity signature of an accessor.
pub fn view_signature(view: &ViewCall) -> &'static str {
    match view {
        ViewCall::TournamentState | ViewCall::MatchState => "state()",
        ViewCall::Level => "level()",
        ViewCall::Levels => "L()",
        ViewCall::ExpectedParticipants => "N()",
        ViewCall::Deposit => "DEPOSIT()",
        ViewCall::CurrentMatch { .. } => "getMatch()",
        ViewCall::TournamentWinner => "lotteryWinner()",
        ViewCall::MatchX => "x()",
        ViewCall::MatchY => "y()",
        ViewCall::MatchWinner => "winner()",
        ViewCall::MatchTimedOut => "timeout()",
    }
}

/// Solidity signature of an event.
pub fn event_signature(name: EventName) -> &'static str {
    match name {
        EventName::Registered => "RegistrationEvent(address,uint256,bytes32[])",
        EventName::RegistrationDone => "RegistrationDoneEvent()",
        EventName::RegistrationAborted => "RegistrationAbortEvent()",
        EventName::AllRefunded => "AllRefundedEvent()",
        EventName::LevelIncreased => "LevelIncreasedEvent()",
        EventName::MatchWinner => "MatchWinnerEvent(uint256,uint256,uint256)",
        EventName::TournamentWinner => "LotteryWinnerEvent(uint256)",
        EventName::XRevealed => "XRevealedEvent(uint256)",
        EventName::YRevealed => "YRevealedEvent(uint256)",
        EventName::Winner => "WinnerEvent(address,bool)",
    }
}

/// Topic 0 of an event.
pub fn event_topic(name: EventName) -> H256 {
    H256(keccak256(event_signature(name).as_bytes()))
}

fn with_selector(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data.into()
}

/// Calldata for a mutating call.
pub fn encode_call(call: &ContractCall) -> Bytes {
    let args = match call {
        ContractCall::Register { commitments } => vec![Token::Array(
            commitments
                .iter()
                .map(|c| Token::FixedBytes(c.as_bytes().to_vec()))
                .collect(),
        )],
        ContractCall::RevealX { secret, salt } | ContractCall::RevealY { secret, salt } => {
            vec![Token::Uint(*secret), Token::Uint(*salt)]
        }
        ContractCall::TimeoutX
        | ContractCall::TimeoutY
        | ContractCall::TimeoutRegistration
        | ContractCall::Refund
        | ContractCall::GoForward => Vec::new(),
    };
    with_selector(call_signature(call), &args)
}

/// Creation payload: lottery bytecode followed by the `(levels, deposit)`
/// constructor arguments.
pub fn encode_deployment(bytecode: &[u8], levels: u32, deposit: U256) -> Bytes {
    let mut data = bytecode.to_vec();
    data.extend(abi::encode(&[Token::Uint(levels.into()), Token::Uint(deposit)]));
    data.into()
}

/// Calldata for an accessor.
pub fn encode_view(view: &ViewCall) -> Bytes {
    with_selector(view_signature(view), &[])
}

/// Return type of an accessor.
fn view_return(view: &ViewCall) -> ParamType {
    match view {
        ViewCall::TournamentState
        | ViewCall::MatchState
        | ViewCall::Level
        | ViewCall::Levels
        | ViewCall::ExpectedParticipants
        | ViewCall::Deposit => ParamType::Uint(256),
        ViewCall::CurrentMatch { .. }
        | ViewCall::TournamentWinner
        | ViewCall::MatchX
        | ViewCall::MatchY
        | ViewCall::MatchWinner => ParamType::Address,
        ViewCall::MatchTimedOut => ParamType::Bool,
    }
}

/// Decode the return data of an accessor.
pub fn decode_view(view: &ViewCall, data: &[u8]) -> Result<ViewValue, LedgerError> {
    let mut tokens = abi::decode(&[view_return(view)], data)
        .map_err(|e| LedgerError::decode(*view, e.to_string()))?;
    match tokens.pop() {
        Some(Token::Uint(value)) => Ok(ViewValue::Uint(value)),
        Some(Token::Address(value)) => Ok(ViewValue::Address(value)),
        Some(Token::Bool(value)) => Ok(ViewValue::Bool(value)),
        other => Err(LedgerError::decode(*view, format!("unexpected token {:?}", other))),
    }
}

/// Word encoding of a view value, as a node would return it.
pub fn encode_view_value(value: &ViewValue) -> Bytes {
    let token = match value {
        ViewValue::Uint(v) => Token::Uint(*v),
        ViewValue::Address(v) => Token::Address(*v),
        ViewValue::Bool(v) => Token::Bool(*v),
    };
    abi::encode(&[token]).into()
}

fn event_params(name: EventName) -> Vec<ParamType> {
    match name {
        EventName::Registered => vec![
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Array(Box::new(ParamType::FixedBytes(32))),
        ],
        EventName::MatchWinner => vec![ParamType::Uint(256); 3],
        EventName::TournamentWinner | EventName::XRevealed | EventName::YRevealed => {
            vec![ParamType::Uint(256)]
        }
        EventName::Winner => vec![ParamType::Address, ParamType::Bool],
        EventName::RegistrationDone
        | EventName::RegistrationAborted
        | EventName::AllRefunded
        | EventName::LevelIncreased => Vec::new(),
    }
}

fn decode_error(name: EventName, detail: impl std::fmt::Display) -> LedgerError {
    LedgerError::Decode {
        view: event_signature(name),
        detail: detail.to_string(),
    }
}

fn uint(name: EventName, token: Option<Token>) -> Result<U256, LedgerError> {
    token
        .and_then(Token::into_uint)
        .ok_or_else(|| decode_error(name, "missing uint argument"))
}

fn small_uint(name: EventName, token: Option<Token>) -> Result<u64, LedgerError> {
    let value = uint(name, token)?;
    if value > U256::from(u64::MAX) {
        return Err(decode_error(name, format!("{} does not fit in u64", value)));
    }
    Ok(value.as_u64())
}

fn address(name: EventName, token: Option<Token>) -> Result<Address, LedgerError> {
    token
        .and_then(Token::into_address)
        .ok_or_else(|| decode_error(name, "missing address argument"))
}

/// Decode the payload of a log known to belong to `name`.
pub fn decode_log(name: EventName, log: &Log) -> Result<EventKind, LedgerError> {
    let tokens = abi::decode(&event_params(name), &log.data).map_err(|e| decode_error(name, e))?;
    let mut args = tokens.into_iter();
    let kind = match name {
        EventName::Registered => EventKind::Registered {
            participant: address(name, args.next())?,
            user_id: small_uint(name, args.next())?,
        },
        EventName::RegistrationDone => EventKind::RegistrationDone,
        EventName::RegistrationAborted => EventKind::RegistrationAborted,
        EventName::AllRefunded => EventKind::AllRefunded,
        EventName::LevelIncreased => EventKind::LevelIncreased,
        EventName::MatchWinner => EventKind::MatchWinner {
            level: small_uint(name, args.next())?,
            match_id: small_uint(name, args.next())?,
            user_id: small_uint(name, args.next())?,
        },
        EventName::TournamentWinner => EventKind::TournamentWinner {
            user_id: small_uint(name, args.next())?,
        },
        EventName::XRevealed => EventKind::XRevealed {
            number: uint(name, args.next())?,
        },
        EventName::YRevealed => EventKind::YRevealed {
            number: uint(name, args.next())?,
        },
        EventName::Winner => EventKind::Winner {
            winner: address(name, args.next())?,
            timed_out: args
                .next()
                .and_then(Token::into_bool)
                .ok_or_else(|| decode_error(name, "missing bool argument"))?,
        },
    };
    Ok(kind)
}
