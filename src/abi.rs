//! Standard contract interface: the supported event kinds, read-only calls,
//! and their decoders.
//!
//! Event and method names are closed enumerations mapped to `sol!`-generated
//! codecs. Requested events are validated against an [`InterfaceDescriptor`]
//! when a contract is registered, not when a log arrives.

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use thiserror::Error;

use crate::{chain::ContractBinding, types::EventRecord};

/// `sol!`-generated codecs for the standard token interface.
pub mod standard {
    alloy::sol! {
        #[derive(Debug, PartialEq)]
        event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

        #[derive(Debug, PartialEq)]
        event Approval(address indexed owner, address indexed approved, uint256 indexed tokenId);

        #[derive(Debug, PartialEq)]
        event ApprovalForAll(address indexed owner, address indexed operator, bool approved);

        #[derive(Debug, PartialEq)]
        event OwnershipTransferred(address indexed previousOwner, address indexed newOwner);

        function tokenURI(uint256 tokenId) external view returns (string);

        function ownerOf(uint256 tokenId) external view returns (address);
    }
}

/// Events the listener can decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Transfer,
    Approval,
    ApprovalForAll,
    OwnershipTransferred,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Transfer,
        EventKind::Approval,
        EventKind::ApprovalForAll,
        EventKind::OwnershipTransferred,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Transfer => "Transfer",
            EventKind::Approval => "Approval",
            EventKind::ApprovalForAll => "ApprovalForAll",
            EventKind::OwnershipTransferred => "OwnershipTransferred",
        }
    }

    /// keccak topic0 for this event.
    #[must_use]
    pub fn signature_hash(self) -> B256 {
        match self {
            EventKind::Transfer => standard::Transfer::SIGNATURE_HASH,
            EventKind::Approval => standard::Approval::SIGNATURE_HASH,
            EventKind::ApprovalForAll => standard::ApprovalForAll::SIGNATURE_HASH,
            EventKind::OwnershipTransferred => standard::OwnershipTransferred::SIGNATURE_HASH,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Read-only methods the listener can issue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    TokenUri,
    OwnerOf,
}

/// A read-only call with its arguments.
#[derive(Clone, Debug, PartialEq)]
pub enum MethodCall {
    TokenUri { token_id: U256 },
    OwnerOf { token_id: U256 },
}

/// A decoded read-only call result.
#[derive(Clone, Debug, PartialEq)]
pub enum MethodValue {
    Uri(String),
    Owner(Address),
}

impl MethodCall {
    /// Solidity-level method name, used to tag call failures.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            MethodCall::TokenUri { .. } => "tokenURI",
            MethodCall::OwnerOf { .. } => "ownerOf",
        }
    }

    /// ABI-encoded calldata.
    #[must_use]
    pub fn abi_encode(&self) -> Vec<u8> {
        use alloy::sol_types::SolCall;
        match self {
            MethodCall::TokenUri { token_id } => {
                standard::tokenURICall { tokenId: *token_id }.abi_encode()
            }
            MethodCall::OwnerOf { token_id } => {
                standard::ownerOfCall { tokenId: *token_id }.abi_encode()
            }
        }
    }

    /// Decodes the raw return bytes for this call.
    pub fn decode_return(&self, data: &[u8]) -> Result<MethodValue, alloy::sol_types::Error> {
        use alloy::sol_types::SolCall;
        match self {
            MethodCall::TokenUri { .. } => {
                Ok(MethodValue::Uri(standard::tokenURICall::abi_decode_returns(data)?))
            }
            MethodCall::OwnerOf { .. } => {
                Ok(MethodValue::Owner(standard::ownerOfCall::abi_decode_returns(data)?))
            }
        }
    }
}

/// The decoding schema a contract was registered with.
///
/// Defaults to the full standard token interface, the fallback used when a
/// registration arrives without a descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    pub events: Vec<EventKind>,
    pub methods: Vec<MethodKind>,
}

impl Default for InterfaceDescriptor {
    fn default() -> Self {
        Self {
            events: EventKind::ALL.to_vec(),
            methods: vec![MethodKind::TokenUri, MethodKind::OwnerOf],
        }
    }
}

impl InterfaceDescriptor {
    #[must_use]
    pub fn supports_event(&self, kind: EventKind) -> bool {
        self.events.contains(&kind)
    }

    #[must_use]
    pub fn supports_method(&self, kind: MethodKind) -> bool {
        self.methods.contains(&kind)
    }
}

/// A raw log could not be turned into an [`EventRecord`].
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("log topic does not match event {0}")]
    TopicMismatch(EventKind),
    #[error("log has no block number (pending)")]
    MissingBlockNumber,
    #[error("log has no transaction hash (pending)")]
    MissingTransactionHash,
    #[error(transparent)]
    Abi(#[from] alloy::sol_types::Error),
}

/// A decoded event plus the token identifier extracted from its parameters,
/// when it carries one. The token id is what triggers enrichment.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedEvent {
    pub record: EventRecord,
    pub token_id: Option<U256>,
}

/// Decodes one raw log into an event record for the given kind.
///
/// Parameter values are stringified the way the upstream documents store
/// them: checksummed addresses, decimal token ids.
pub fn decode_event(
    kind: EventKind,
    binding: &ContractBinding,
    log: &Log,
) -> Result<DecodedEvent, DecodeError> {
    if log.topic0() != Some(&kind.signature_hash()) {
        return Err(DecodeError::TopicMismatch(kind));
    }
    let block_number = log.block_number.ok_or(DecodeError::MissingBlockNumber)?;
    let transaction_hash = log.transaction_hash.ok_or(DecodeError::MissingTransactionHash)?;

    let (params, token_id) = match kind {
        EventKind::Transfer => {
            let ev = standard::Transfer::decode_log(&log.inner)?;
            (
                json!({
                    "from": ev.data.from.to_string(),
                    "to": ev.data.to.to_string(),
                    "tokenId": ev.data.tokenId.to_string(),
                }),
                Some(ev.data.tokenId),
            )
        }
        EventKind::Approval => {
            let ev = standard::Approval::decode_log(&log.inner)?;
            (
                json!({
                    "owner": ev.data.owner.to_string(),
                    "approved": ev.data.approved.to_string(),
                    "tokenId": ev.data.tokenId.to_string(),
                }),
                Some(ev.data.tokenId),
            )
        }
        EventKind::ApprovalForAll => {
            let ev = standard::ApprovalForAll::decode_log(&log.inner)?;
            (
                json!({
                    "owner": ev.data.owner.to_string(),
                    "operator": ev.data.operator.to_string(),
                    "approved": ev.data.approved,
                }),
                None,
            )
        }
        EventKind::OwnershipTransferred => {
            let ev = standard::OwnershipTransferred::decode_log(&log.inner)?;
            (
                json!({
                    "previousOwner": ev.data.previousOwner.to_string(),
                    "newOwner": ev.data.newOwner.to_string(),
                }),
                None,
            )
        }
    };

    Ok(DecodedEvent {
        record: EventRecord {
            address: binding.address,
            network: binding.network,
            transaction_hash,
            block_number,
            event: kind,
            params,
        },
        token_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{approval_for_all_log, transfer_log},
        types::Network,
    };

    fn binding() -> ContractBinding {
        ContractBinding { address: Address::repeat_byte(0xAA), network: Network::Rinkeby }
    }

    #[test]
    fn transfer_decodes_with_token_id() {
        let binding = binding();
        let log = transfer_log(binding.address, 42, 100, 1);

        let decoded = decode_event(EventKind::Transfer, &binding, &log).unwrap();

        assert_eq!(decoded.token_id, Some(U256::from(42)));
        assert_eq!(decoded.record.block_number, 100);
        assert_eq!(decoded.record.event, EventKind::Transfer);
        assert_eq!(decoded.record.params["tokenId"], "42");
    }

    #[test]
    fn approval_for_all_has_no_token_id() {
        let binding = binding();
        let log = approval_for_all_log(binding.address, 100, 2);

        let decoded = decode_event(EventKind::ApprovalForAll, &binding, &log).unwrap();

        assert_eq!(decoded.token_id, None);
        assert_eq!(decoded.record.params["approved"], true);
    }

    #[test]
    fn topic_mismatch_is_rejected() {
        let binding = binding();
        let log = transfer_log(binding.address, 1, 100, 1);

        let err = decode_event(EventKind::Approval, &binding, &log).unwrap_err();
        assert!(matches!(err, DecodeError::TopicMismatch(EventKind::Approval)));
    }

    #[test]
    fn pending_log_is_rejected() {
        let binding = binding();
        let mut log = transfer_log(binding.address, 1, 100, 1);
        log.block_number = None;

        let err = decode_event(EventKind::Transfer, &binding, &log).unwrap_err();
        assert!(matches!(err, DecodeError::MissingBlockNumber));
    }

    #[test]
    fn default_descriptor_covers_standard_interface() {
        let descriptor = InterfaceDescriptor::default();
        for kind in EventKind::ALL {
            assert!(descriptor.supports_event(kind));
        }
        assert!(descriptor.supports_method(MethodKind::TokenUri));
    }

    #[test]
    fn method_calls_are_tagged_with_solidity_names() {
        assert_eq!(MethodCall::TokenUri { token_id: U256::ZERO }.name(), "tokenURI");
        assert_eq!(MethodCall::OwnerOf { token_id: U256::ZERO }.name(), "ownerOf");
    }

    #[test]
    fn owner_of_return_data_decodes_to_an_address() {
        use alloy::sol_types::SolValue;

        let owner = Address::repeat_byte(0x42);
        let call = MethodCall::OwnerOf { token_id: U256::from(7) };

        let value = call.decode_return(&owner.abi_encode()).unwrap();
        assert_eq!(value, MethodValue::Owner(owner));
    }
}
