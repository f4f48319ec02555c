//! Hub chain contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the relay
//! (shadow ledger) and transport contracts.

use alloy::sol;

sol! {
    /// Shadow ledger relay contract
    #[sol(rpc)]
    contract RelayContract {
        /// Lifecycle state of the relay contract; 2 means operating
        function getContractState() external view returns (uint256 state);

        /// Key of the genesis entry established at protocol start
        function getGenesisHash() external view returns (bytes32 genesisKey);

        /// Key of the current ledger top
        function getTopKeyFromShadowLedger() external view returns (bytes32 topKey);

        /// Source height of the current ledger top
        function getTopHeight() external view returns (uint256 height);

        /// Commit state of a candidate slot under a parent key; zero when
        /// nobody has committed it yet
        function getCommitState(bytes32 candidateKey, bytes32 parentKey)
            external view returns (uint256 commitState);

        /// Minimum stake required from a relayer
        function getRequireStake() external view returns (uint256 requiredStake);

        /// Stake held by msg.sender
        function getMyStake() external view returns (uint256 stake);

        /// Stake (more) native currency to act as a relayer
        function becomeRelayer() external payable;

        /// Confirm the previous top with its raw header and commit to the
        /// next candidate key
        ///
        /// # Arguments
        /// * `prevRawHeader` - Raw header of the entry being confirmed
        /// * `candidateKey` - Hash of the next source header
        /// * `commitment` - keccak256(candidate raw header || relayer address)
        function updateShadowLedgerByRelayer(
            bytes prevRawHeader,
            bytes32 candidateKey,
            bytes32 commitment
        ) external;
    }
}

sol! {
    /// Transport task contract
    #[sol(rpc)]
    contract TransportContract {
        /// Relay contract whose shadow ledger anchors proofs
        function getRelayContract() external view returns (address relay);

        /// Multichain manager the transport contract registered with
        function getMultiChain() external view returns (address manager);

        /// Number of tasks ever created
        function getTaskNum() external view returns (uint256 count);

        function getTaskHashByNum(uint256 index) external view returns (bytes32 taskHash);

        function getTaskByHash(bytes32 taskHash) external view returns (
            address user,
            address relayer,
            bytes rawTx,
            uint256 state,
            uint256 timestamp
        );

        /// User entry point: open a task for a raw source transaction
        function createTask(bytes rawTx) external;

        function acceptTask(bytes32 taskHash) external;

        /// Take over a task whose holder let the timeout expire
        function reAcceptTask(bytes32 taskHash) external;

        /// Settle a held task with an inclusion proof
        ///
        /// # Arguments
        /// * `taskHash` - Task identifier (source transaction id)
        /// * `proof` - 32-byte big-endian leaf index followed by sibling hashes
        /// * `anchorKey` - Shadow ledger key of the block recording the transaction
        function finishTask(bytes32 taskHash, bytes proof, bytes anchorKey)
            external returns (bool);
    }
}
