mod watch_delivery_test;
