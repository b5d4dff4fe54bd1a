// Test modules for natmap
// Loopback only: fake STUN/DNS servers and mock routers live in `support`

mod support;

mod keepalive_tests;
