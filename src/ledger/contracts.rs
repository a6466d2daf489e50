//! Solidity bindings for the contracts the node talks to.

#![allow(missing_docs)]

alloy::sol! {
    /// Signer manager: maps principals to their agent wallets and relays
    /// calls made on an agent's behalf.
    #[sol(rpc)]
    interface IAgentManager {
        function userToAgent(address user) external view returns (address);
        function createAgent(address user, uint256 dailyLimit) external returns (address);
        function executeFromAgent(address agent, address target, uint256 value, bytes data, uint256 amountUSDC) external;
        function remainingDailyAllowance(address agent) external view returns (uint256);
    }

    /// Payment token (USDC, 6 decimals).
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }

    /// Pay-per-access ledger contract.
    #[sol(rpc)]
    interface IAgenticCommerce {
        event ProductPaid(address indexed buyer, uint256 indexed productId, uint256 amount);
        function payForProduct(uint256 productId, string task, bytes32 receiptId) external;
    }
}
