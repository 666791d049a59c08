mod script_test;
