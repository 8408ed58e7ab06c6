//! Payment-channel contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the channel
//! contract and the ERC20 interface used for deposit approvals.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Bilateral payment-channel contract interface
    #[sol(rpc)]
    contract PaymentChannels {
        // ========================================================================
        // Channel lifecycle
        // ========================================================================

        /// Open a channel to `partner`; deterministically derives the channel id
        /// from the canonical participant ordering and the pair's deposit epoch.
        /// Native-token channels carry the deposit as call value.
        function openChannel(
            address partner,
            address token,
            uint256 settlementTimeout,
            uint256 initialDeposit
        ) external payable returns (bytes32 channelId);

        /// Raise a participant's total deposit (monotonic; pulls the delta)
        function setTotalDeposit(bytes32 channelId, address participant, uint256 newTotal) external payable;

        /// Unilateral close with the counterparty's latest signed balance proof.
        /// Starts the challenge period.
        function closeChannel(
            bytes32 channelId,
            uint256 nonce,
            uint256 transferredAmount,
            uint256 lockedAmount,
            bytes32 locksRoot,
            bytes partnerSignature
        ) external;

        /// During the challenge period, replace a stale closing proof with a
        /// later one signed by the closing side
        function updateNonClosingBalanceProof(
            bytes32 channelId,
            uint256 nonce,
            uint256 transferredAmount,
            uint256 lockedAmount,
            bytes32 locksRoot,
            bytes closingSignature
        ) external;

        /// Final payout after the challenge period elapsed
        function settleChannel(
            bytes32 channelId,
            uint256 participant1Transferred,
            uint256 participant1Locked,
            bytes32 participant1LocksRoot,
            uint256 participant2Transferred,
            uint256 participant2Locked,
            bytes32 participant2LocksRoot
        ) external;

        /// Immediate payout with both sides' signatures over matching nonces
        function cooperativeSettle(
            bytes32 channelId,
            uint256 nonce,
            uint256 participant1Transferred,
            uint256 participant2Transferred,
            bytes participant1Signature,
            bytes participant2Signature
        ) external;

        /// Counterparty-authorized partial withdrawal without closing
        function withdraw(
            bytes32 channelId,
            address participant,
            uint256 amount,
            uint256 nonce,
            uint256 expiry,
            bytes partnerSignature
        ) external;

        /// Permissionless cleanup once the channel's maximum lifetime passed
        function forceCloseExpired(bytes32 channelId) external;

        // ========================================================================
        // View functions
        // ========================================================================

        /// Channel phase (0 = open, 1 = closed/challenge, 2 = settled),
        /// settlement timeout and, when closed, the challenge deadline
        function getChannelInfo(bytes32 channelId) external view returns (
            uint8 phase,
            uint256 settlementTimeout,
            uint256 challengeDeadline
        );

        /// The two participants in canonical (lower address first) order
        function getChannelParticipants(bytes32 channelId) external view returns (
            address participant1,
            address participant2
        );

        /// Per-participant channel state
        function getParticipantInfo(bytes32 channelId, address participant) external view returns (
            uint256 totalDeposit,
            uint256 totalWithdrawn,
            uint256 transferredAmount,
            uint256 nonce
        );

        // ========================================================================
        // Events
        // ========================================================================

        /// Channel opened between two participants
        event ChannelOpened(
            bytes32 indexed channelId,
            address indexed participant1,
            address indexed participant2,
            uint256 settlementTimeout
        );

        /// Unilateral close submitted; challenge period running
        event ChannelClosed(
            bytes32 indexed channelId,
            address indexed closingParticipant,
            uint256 nonce,
            bytes32 balanceHash
        );

        /// Challenge elapsed and payout executed
        event ChannelSettled(
            bytes32 indexed channelId,
            uint256 participant1Amount,
            uint256 participant2Amount
        );

        /// Both-signatures payout, challenge period bypassed
        event ChannelCooperativeSettled(
            bytes32 indexed channelId,
            uint256 participant1Amount,
            uint256 participant2Amount
        );
    }

    // ========================================================================
    // ERC20 interface for deposit approvals
    // ========================================================================

    /// Standard ERC20 interface
    #[sol(rpc)]
    contract ERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);

        event Approval(address indexed owner, address indexed spender, uint256 value);
    }
}
